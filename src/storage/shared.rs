use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::LockFailed;
use crate::models::LockRecord;
use crate::storage::{LockStrategy, StorageMedium};

/// Prefix for every record written by [`SharedStore`], so lock records never
/// collide with unrelated data in the same medium.
pub const NAMESPACE: &str = "storelock:";

/// Default settle delay: long enough for a racing writer's own write to
/// land, short enough that callers never notice it.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(5);

const GC_INTERVAL_MS: i64 = 60_000;

// Last GC run (epoch millis), shared by every SharedStore in the process.
// 0 means never ran.
static LAST_GC_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Reset the process-wide garbage-collection throttle, so the next
/// [`SharedStore`] constructed runs a sweep immediately. Test-isolation hook.
pub fn reset_gc_timer() {
    LAST_GC_MILLIS.store(0, Ordering::SeqCst);
}

/// Lock backend over a shared, non-atomic key/value medium.
///
/// Two holders can interleave writes to the medium, so a single write proves
/// nothing. `acquire` therefore checks the current holder, writes its record
/// optimistically, waits out a short settle delay and re-reads: if the record
/// no longer carries our holder id, another writer won the race and we fail
/// with [`LockFailed`] without touching the winner's record.
///
/// This is a probabilistic race reducer, not linearizable exclusion: a third
/// writer can still land between the settle re-read and whatever the caller
/// does next. Cooperative, well-behaved clients only.
pub struct SharedStore<M: StorageMedium> {
    medium: M,
    settle_delay: Duration,
}

impl<M> SharedStore<M>
where
    M: StorageMedium + Clone + 'static,
{
    /// Build a store with the default settle delay and kick off an
    /// opportunistic, rate-limited garbage sweep. Must be called within a
    /// tokio runtime.
    pub fn new(medium: M) -> Self {
        Self::with_settle_delay(medium, DEFAULT_SETTLE_DELAY)
    }

    /// A zero `settle_delay` skips the verify re-read entirely and trusts
    /// the initial write. Only for media known to be race-free, or callers
    /// who accept the risk.
    pub fn with_settle_delay(medium: M, settle_delay: Duration) -> Self {
        let store = Self {
            medium,
            settle_delay,
        };
        store.spawn_gc();
        store
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", NAMESPACE, key)
    }

    async fn read(&self, storage_key: &str) -> Result<Option<LockRecord>> {
        match self.medium.get(storage_key).await? {
            Some(raw) => {
                let record: LockRecord = serde_json::from_str(&raw)
                    .with_context(|| format!("corrupted lock record at {}", storage_key))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, storage_key: &str, record: &LockRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.medium.set(storage_key, &raw).await
    }

    /// Defensive cleanup at TTL: remove the record at expiry if it still
    /// belongs to `holder_id` and has actually lapsed. A renewal moves
    /// `expires_at` forward, which turns a stale expiry task into a no-op;
    /// a well-behaved client will have released or renewed long before this
    /// fires.
    fn schedule_expiry(&self, storage_key: String, holder_id: &str, ttl: Duration) {
        let medium = self.medium.clone();
        let holder = holder_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Ok(Some(raw)) = medium.get(&storage_key).await else {
                return;
            };
            let Ok(record) = serde_json::from_str::<LockRecord>(&raw) else {
                return;
            };
            if record.holder_id == holder && record.is_expired() {
                if let Err(err) = medium.remove(&storage_key).await {
                    log::warn!("[EXPIRED] Failed to remove lapsed record {}: {:#}", storage_key, err);
                } else {
                    log::debug!("[EXPIRED] Removed lapsed record - key: {}, holder: {}", storage_key, holder);
                }
            }
        });
    }

    /// 清理过期锁 — opportunistic, at most once per minute across all
    /// instances in the process.
    fn spawn_gc(&self) {
        if !gc_due() {
            return;
        }
        let medium = self.medium.clone();
        tokio::spawn(async move {
            if let Err(err) = sweep_expired(&medium).await {
                log::warn!("[CLEANUP] Garbage sweep failed: {:#}", err);
            }
        });
    }
}

/// Claim the GC slot if the interval has elapsed (or GC never ran). Exactly
/// one caller wins per interval.
fn gc_due() -> bool {
    let now = Utc::now().timestamp_millis();
    let last = LAST_GC_MILLIS.load(Ordering::SeqCst);
    if last != 0 && now - last < GC_INTERVAL_MS {
        return false;
    }
    LAST_GC_MILLIS
        .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Scan the namespace and drop every record whose lease has lapsed, so a
/// crashed holder cannot block a key forever. Unreadable records are left
/// in place and logged.
async fn sweep_expired<M: StorageMedium>(medium: &M) -> Result<()> {
    let keys = medium.keys(NAMESPACE).await?;
    let mut removed = 0usize;

    for storage_key in keys {
        let Some(raw) = medium.get(&storage_key).await? else {
            continue;
        };
        let record: LockRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("[CLEANUP] Skipping unreadable record {}: {}", storage_key, err);
                continue;
            }
        };
        if record.is_expired() {
            medium.remove(&storage_key).await?;
            log::info!(
                "[CLEANUP] Removed expired lock - key: {}, holder: {}",
                storage_key,
                record.holder_id
            );
            removed += 1;
        }
    }

    if removed > 0 {
        log::info!("[CLEANUP] Garbage sweep removed {} expired locks", removed);
    }
    Ok(())
}

#[async_trait]
impl<M> LockStrategy for SharedStore<M>
where
    M: StorageMedium + Clone + 'static,
{
    async fn acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<()> {
        if !self.settle_delay.is_zero() && ttl <= self.settle_delay {
            bail!(
                "ttl {:?} must exceed the settle delay {:?}",
                ttl,
                self.settle_delay
            );
        }

        let storage_key = self.storage_key(key);

        if let Some(current) = self.read(&storage_key).await? {
            if current.blocks(holder_id) {
                return Err(LockFailed::Held {
                    holder: current.holder_id,
                }
                .into());
            }
        }

        // Optimistic claim; the settle re-read below decides whether it held.
        self.write(&storage_key, &LockRecord::new(holder_id, ttl)).await?;

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
            match self.read(&storage_key).await? {
                Some(record) if record.holder_id != holder_id => {
                    log::debug!(
                        "[RACE] Lost the settle window - key: {}, holder: {}, winner: {}",
                        key,
                        holder_id,
                        record.holder_id
                    );
                    return Err(LockFailed::Raced {
                        holder: record.holder_id,
                    }
                    .into());
                }
                _ => {}
            }
        }

        self.schedule_expiry(storage_key, holder_id, ttl);
        log::debug!(
            "[ACQUIRE] Lock acquired - key: {}, holder: {}, ttl: {:?}",
            key,
            holder_id,
            ttl
        );
        Ok(())
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<()> {
        let storage_key = self.storage_key(key);

        match self.read(&storage_key).await? {
            Some(record) if record.blocks(holder_id) => Ok(()), // someone else's live lock
            Some(_) => {
                self.medium.remove(&storage_key).await?;
                log::debug!("[RELEASE] Lock released - key: {}, holder: {}", key, holder_id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// In-process simulation of the shared medium: one `Clone`d handle per
/// "context", all reading and writing the same cells with no atomicity
/// across await points. Doubles as the test medium.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    cells: Arc<DashMap<String, String>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageMedium for MemoryMedium {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cells.get(key).map(|cell| cell.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cells.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cells.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .cells
            .iter()
            .filter(|cell| cell.key().starts_with(prefix))
            .map(|cell| cell.key().clone())
            .collect())
    }
}
