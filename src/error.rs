use std::time::Duration;

use thiserror::Error;

/// The lock could not be obtained or retained.
///
/// This is the only failure class worth retrying: the key is (or was, a
/// moment ago) claimed by another holder. Everything else coming out of a
/// strategy — storage I/O errors, unreadable records, bad configuration —
/// is propagated as a plain [`anyhow::Error`] and must not be retried.
#[derive(Debug, Error)]
pub enum LockFailed {
    /// Another holder has a live, non-expired record for the key.
    #[error("lock is held by {holder}")]
    Held { holder: String },

    /// The optimistic write was overwritten during the settle window.
    #[error("lost the lock race to {holder}")]
    Raced { holder: String },

    /// `must_acquire` gave up after retrying for the full timeout.
    #[error("timed out after {0:?} waiting for the lock")]
    TimedOut(Duration),
}

impl LockFailed {
    /// Whether `err` is a lock-contention failure rather than an opaque one.
    pub fn caused(err: &anyhow::Error) -> bool {
        err.downcast_ref::<LockFailed>().is_some()
    }
}
