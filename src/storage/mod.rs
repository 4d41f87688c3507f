pub mod memory;
pub mod redis;
pub mod shared;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// The substrate every lock backend must satisfy.
///
/// `acquire` claims `key` for `holder_id` for `ttl`. It must fail with
/// [`LockFailed`](crate::LockFailed) while another holder has a live record
/// for `key`, and it never blocks beyond a bounded, backend-defined
/// verification delay. An acquire by the current holder extends the lease.
/// A backend may accept the claim optimistically and only then discover it
/// lost a race; that discovery still surfaces as `LockFailed`.
///
/// `release` clears the record for `key` only if it is unheld or held by
/// `holder_id`; releasing a lock held by someone else is a silent no-op.
#[async_trait]
pub trait LockStrategy: Send + Sync {
    /// 尝试获取锁
    async fn acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<()>;

    /// 释放锁
    async fn release(&self, key: &str, holder_id: &str) -> Result<()>;
}

/// Raw key/value seam driven by [`shared::SharedStore`].
///
/// A medium is a dumb shared store with no compare-and-swap: plain string
/// cells that any number of independent contexts may read and write. All
/// race avoidance lives above it, in the store's settle protocol.
#[async_trait]
pub trait StorageMedium: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// List every stored key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
