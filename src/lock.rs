use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::LockFailed;
use crate::models::new_holder_id;
use crate::storage::LockStrategy;

/// How often `must_acquire` retries a contended key.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// How long `must_acquire` keeps retrying before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease duration used by `whilst` when the caller does not pick one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// A named mutual-exclusion lock over a pluggable [`LockStrategy`].
///
/// Each instance carries a stable holder identity generated at
/// construction; create one `Lock` per logical lock user and reuse it
/// across acquire/release cycles. The identity is the sole basis for
/// ownership checks, so two instances never mistake each other's records
/// for their own.
///
/// Operations on one instance are expected to be serialized by the caller;
/// issuing concurrent `acquire`/`whilst` calls on the same instance is not
/// supported and the behavior is undefined.
pub struct Lock {
    key: String,
    holder_id: String,
    strategy: Arc<dyn LockStrategy>,
    retry_interval: Duration,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Lock {
    pub fn new(key: impl Into<String>, strategy: Arc<dyn LockStrategy>) -> Self {
        Self {
            key: key.into(),
            holder_id: new_holder_id(),
            strategy,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            maintenance: Mutex::new(None),
        }
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// One attempt to claim the key for `ttl`. Fails with [`LockFailed`]
    /// if another holder has it; never retries.
    pub async fn acquire(&self, ttl: Duration) -> Result<()> {
        self.strategy.acquire(&self.key, &self.holder_id, ttl).await
    }

    /// Retry [`acquire`](Self::acquire) until it succeeds or
    /// [`DEFAULT_ACQUIRE_TIMEOUT`] elapses.
    pub async fn must_acquire(&self, ttl: Duration) -> Result<()> {
        self.must_acquire_within(ttl, DEFAULT_ACQUIRE_TIMEOUT).await
    }

    /// Retry `acquire` every retry interval until it succeeds, failing with
    /// [`LockFailed::TimedOut`] once `timeout` has elapsed since the first
    /// attempt. Only contention failures are retried; any other error
    /// aborts immediately.
    pub async fn must_acquire_within(&self, ttl: Duration, timeout: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            match self.acquire(ttl).await {
                Ok(()) => return Ok(()),
                Err(err) if LockFailed::caused(&err) => {
                    if started.elapsed() >= timeout {
                        log::debug!(
                            "[ACQUIRE] Gave up on contended lock - key: {}, holder: {}, timeout: {:?}",
                            self.key,
                            self.holder_id,
                            timeout
                        );
                        return Err(LockFailed::TimedOut(timeout).into());
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stop the maintenance loop, then let go of the key. Idempotent:
    /// releasing an unheld or already-released lock is a no-op.
    pub async fn release(&self) -> Result<()> {
        self.stop_maintenance();
        self.strategy.release(&self.key, &self.holder_id).await
    }

    /// Run `f` under the lock with the default lease and timeout.
    pub async fn whilst<T, F>(&self, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.whilst_with(DEFAULT_TTL, DEFAULT_ACQUIRE_TIMEOUT, f).await
    }

    /// Acquire (blocking up to `timeout`), keep the lease renewed at half
    /// the TTL while `f` runs, and always release afterwards, whichever way
    /// `f` ends. Renewal failures are swallowed: losing the lease
    /// mid-section is an accepted risk of this best-effort protocol, and
    /// there is nobody useful to surface them to.
    pub async fn whilst_with<T, F>(&self, ttl: Duration, timeout: Duration, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.must_acquire_within(ttl, timeout).await?;
        self.start_maintenance(ttl);

        let outcome = f.await;

        if let Err(err) = self.release().await {
            // f's outcome wins; the lease lapses at TTL regardless.
            log::warn!(
                "[RELEASE] Failed to release after critical section - key: {}, holder: {}: {:#}",
                self.key,
                self.holder_id,
                err
            );
        }
        outcome
    }

    fn start_maintenance(&self, ttl: Duration) {
        let strategy = self.strategy.clone();
        let key = self.key.clone();
        let holder_id = self.holder_id.clone();

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(ttl / 2);
            ticks.tick().await; // first tick completes immediately
            loop {
                ticks.tick().await;
                match strategy.acquire(&key, &holder_id, ttl).await {
                    Ok(()) => {
                        log::debug!("[RENEW] Lease renewed - key: {}, holder: {}", key, holder_id)
                    }
                    Err(err) => log::warn!(
                        "[RENEW] Failed to renew lease - key: {}, holder: {}: {:#}",
                        key,
                        holder_id,
                        err
                    ),
                }
            }
        });

        if let Some(previous) = self.maintenance.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_maintenance(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        // The backend record expires on its own; only the renewal task must
        // not outlive the instance.
        self.stop_maintenance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn pair(store: &MemoryStore) -> (Lock, Lock) {
        let a = Lock::new("job", Arc::new(store.clone()));
        let b = Lock::new("job", Arc::new(store.clone())).retry_interval(Duration::from_millis(10));
        (a, b)
    }

    #[tokio::test]
    async fn instances_get_distinct_holder_identities() {
        let store = MemoryStore::new();
        let (a, b) = pair(&store);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.holder_id(), b.holder_id());
    }

    #[tokio::test]
    async fn acquire_does_not_retry() {
        let store = MemoryStore::new();
        let (a, b) = pair(&store);
        a.acquire(Duration::from_millis(200)).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = b.acquire(Duration::from_millis(200)).await.unwrap_err();
        assert!(LockFailed::caused(&err));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn must_acquire_waits_for_the_ttl() {
        let store = MemoryStore::new();
        let (a, b) = pair(&store);
        a.acquire(Duration::from_millis(200)).await.unwrap();

        let started = tokio::time::Instant::now();
        b.must_acquire(Duration::from_millis(200)).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(150), "resolved after {:?}", waited);
    }

    #[tokio::test]
    async fn must_acquire_times_out() {
        let store = MemoryStore::new();
        let (a, b) = pair(&store);
        a.acquire(Duration::from_secs(60)).await.unwrap();

        let err = b
            .must_acquire_within(Duration::from_millis(200), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LockFailed>(),
            Some(LockFailed::TimedOut(_))
        ));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = MemoryStore::new();
        let lock = Lock::new("job", Arc::new(store));
        lock.release().await.unwrap(); // never acquired

        lock.acquire(Duration::from_millis(200)).await.unwrap();
        lock.release().await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn whilst_returns_the_functions_outcome() {
        let store = MemoryStore::new();
        let lock = Lock::new("job", Arc::new(store));

        let value = lock.whilst(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn whilst_releases_after_a_failing_function() {
        let store = MemoryStore::new();
        let (a, b) = pair(&store);

        let err = a
            .whilst(async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");

        // The failure released the key.
        b.acquire(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn whilst_keeps_the_lease_renewed() {
        let store = MemoryStore::new();
        let (a, b) = pair(&store);

        let section = a.whilst_with(
            Duration::from_millis(150),
            DEFAULT_ACQUIRE_TIMEOUT,
            async {
                // Outlives the lease several times over; renewal at 75ms
                // keeps the record alive throughout.
                tokio::time::sleep(Duration::from_millis(600)).await;
                Ok(())
            },
        );
        let contender = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let err = b.acquire(Duration::from_millis(150)).await.unwrap_err();
            assert!(LockFailed::caused(&err));
        };
        let (held, ()) = tokio::join!(section, contender);
        held.unwrap();

        // Once whilst returns, the key is free again.
        b.acquire(Duration::from_millis(150)).await.unwrap();
    }
}
