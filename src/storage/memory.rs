use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::error::LockFailed;
use crate::models::LockRecord;
use crate::storage::LockStrategy;

/// In-process atomic backend.
///
/// The read-check-write sequence runs under a single DashMap entry guard, so
/// there is no race to detect and no settle delay. Useful as the race-free
/// reference backend and for coordinating tasks within one process. Cloning
/// a `MemoryStore` shares its state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    records: DashMap<String, LockRecord>, // key -> record
    expiry_tasks: DashMap<String, JoinHandle<()>>, // key -> pending expiry
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                records: DashMap::new(),
                expiry_tasks: DashMap::new(),
            }),
        }
    }

    /// Arm the single expiry timer for `key`, replacing (and cancelling) any
    /// previous one. Renewal by the same holder therefore pushes the expiry
    /// out instead of letting the old timer fire early.
    fn arm_expiry(&self, key: &str, holder_id: &str, ttl: Duration) {
        let inner = self.inner.clone();
        let task_key = key.to_string();
        let holder = holder_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let removed = inner
                .records
                .remove_if(&task_key, |_, record| record.holder_id == holder);
            if removed.is_some() {
                log::debug!(
                    "[EXPIRED] Lock expired and removed - key: {}, holder: {}",
                    task_key,
                    holder
                );
            }
            inner.expiry_tasks.remove(&task_key);
        });

        if let Some(previous) = self.inner.expiry_tasks.insert(key.to_string(), task) {
            previous.abort();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStrategy for MemoryStore {
    async fn acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<()> {
        match self.inner.records.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.blocks(holder_id) {
                    return Err(LockFailed::Held {
                        holder: current.holder_id.clone(),
                    }
                    .into());
                }
                if current.is_held_by(holder_id) {
                    log::debug!(
                        "[RENEW] Same holder re-acquiring lock - key: {}, holder: {}",
                        key,
                        holder_id
                    );
                }
                slot.insert(LockRecord::new(holder_id, ttl));
            }
            Entry::Vacant(slot) => {
                slot.insert(LockRecord::new(holder_id, ttl));
            }
        }

        self.arm_expiry(key, holder_id, ttl);
        log::debug!(
            "[ACQUIRE] Lock acquired - key: {}, holder: {}, ttl: {:?}",
            key,
            holder_id,
            ttl
        );
        Ok(())
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<()> {
        let removed = self
            .inner
            .records
            .remove_if(key, |_, record| !record.blocks(holder_id));

        if removed.is_some() {
            if let Some((_, task)) = self.inner.expiry_tasks.remove(key) {
                task.abort();
            }
            log::debug!("[RELEASE] Lock released - key: {}, holder: {}", key, holder_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn second_holder_is_rejected() {
        let store = MemoryStore::new();
        store.acquire("job", "a", TTL).await.unwrap();

        let err = store.acquire("job", "b", TTL).await.unwrap_err();
        assert!(LockFailed::caused(&err));
    }

    #[tokio::test]
    async fn same_holder_renews() {
        let store = MemoryStore::new();
        store.acquire("job", "a", TTL).await.unwrap();
        store.acquire("job", "a", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn expiry_timer_frees_the_key() {
        let store = MemoryStore::new();
        store.acquire("job", "a", Duration::from_millis(50)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.inner.records.get("job").is_none());
        store.acquire("job", "b", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn renewal_rearms_the_expiry_timer() {
        let store = MemoryStore::new();
        store.acquire("job", "a", Duration::from_millis(100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        store.acquire("job", "a", Duration::from_millis(100)).await.unwrap();

        // The original timer would have fired by now; the renewed one not yet.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = store.acquire("job", "b", TTL).await.unwrap_err();
        assert!(LockFailed::caused(&err));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_noop() {
        let store = MemoryStore::new();
        store.acquire("job", "a", TTL).await.unwrap();
        store.release("job", "b").await.unwrap();

        let err = store.acquire("job", "c", TTL).await.unwrap_err();
        assert!(LockFailed::caused(&err));
    }

    #[tokio::test]
    async fn release_then_reacquire() {
        let store = MemoryStore::new();
        store.acquire("job", "a", TTL).await.unwrap();
        store.release("job", "a").await.unwrap();
        store.acquire("job", "b", TTL).await.unwrap();
    }
}
