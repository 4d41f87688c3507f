//! Best-effort named locks over shared, non-atomic key/value storage.
//!
//! `storelock` coordinates independent execution contexts (processes,
//! workers, anything that can only talk through a shared store) with
//! mutual-exclusion locks keyed by a string name. The storage is not
//! assumed to offer compare-and-swap: exclusion is approximated with an
//! optimistic write-then-verify protocol, time-bounded leases, and
//! periodic lease renewal for long critical sections.
//!
//! This is cooperative locking. A well-behaved client set gets reliable
//! exclusion; a crashed holder is swept away once its lease lapses; a
//! malicious client can still corrupt the shared state. Do not use this
//! where you need linearizability.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use storelock::{Lock, MemoryMedium, SharedStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let medium = MemoryMedium::new();
//!     let strategy = Arc::new(SharedStore::new(medium));
//!
//!     let lock = Lock::new("nightly-report", strategy);
//!     lock.whilst(async {
//!         // Exclusive for the whole section; the lease renews itself.
//!         Ok(())
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`MemoryStore`]: race-free in-process backend, also the reference
//!   implementation of the [`LockStrategy`] contract.
//! - [`SharedStore`]: the write-then-verify backend over any
//!   [`StorageMedium`]. Ships with [`MemoryMedium`] (in-process simulation
//!   of a shared store) and [`RedisMedium`].
//!
//! Any type implementing [`LockStrategy`] plugs into [`Lock`] unchanged.

pub mod error;
pub mod lock;
pub mod models;
pub mod storage;

pub use error::LockFailed;
pub use lock::{Lock, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_RETRY_INTERVAL, DEFAULT_TTL};
pub use models::LockRecord;
pub use storage::memory::MemoryStore;
pub use storage::redis::RedisMedium;
pub use storage::shared::{reset_gc_timer, MemoryMedium, SharedStore, DEFAULT_SETTLE_DELAY};
pub use storage::{LockStrategy, StorageMedium};
