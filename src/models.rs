use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A lock record as a strategy stores it, one per key.
///
/// `expires_at: None` is the "never expires" sentinel. A record counts as
/// held only while `expires_at` is strictly in the future (or absent); an
/// expired record is as good as no record at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub fn new(holder_id: &str, ttl: Duration) -> Self {
        Self {
            holder_id: holder_id.to_string(),
            expires_at: Some(Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now(),
            None => false,
        }
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        !self.is_expired() && self.holder_id == holder_id
    }

    /// A live record belonging to someone else blocks `holder_id`.
    pub fn blocks(&self, holder_id: &str) -> bool {
        !self.is_expired() && self.holder_id != holder_id
    }
}

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a holder identity: high-entropy uuid plus a process-wide
/// sequence number, so two instances created in the same instant still
/// cannot collide.
pub(crate) fn new_holder_id() -> String {
    format!(
        "{}-{}",
        Uuid::new_v4(),
        HOLDER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_held() {
        let record = LockRecord::new("a", Duration::from_secs(60));
        assert!(!record.is_expired());
        assert!(record.is_held_by("a"));
        assert!(record.blocks("b"));
        assert!(!record.blocks("a"));
    }

    #[test]
    fn expired_record_blocks_nobody() {
        let record = LockRecord {
            holder_id: "a".to_string(),
            expires_at: Some(Utc::now() - chrono::Duration::milliseconds(1)),
        };
        assert!(record.is_expired());
        assert!(!record.is_held_by("a"));
        assert!(!record.blocks("b"));
    }

    #[test]
    fn sentinel_record_never_expires() {
        let record = LockRecord {
            holder_id: "a".to_string(),
            expires_at: None,
        };
        assert!(!record.is_expired());
        assert!(record.blocks("b"));
    }

    #[test]
    fn record_round_trips_as_json() {
        let record = LockRecord::new("holder-1", Duration::from_secs(1));
        let json = serde_json::to_string(&record).unwrap();
        let back: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.holder_id, "holder-1");
        assert_eq!(back.expires_at, record.expires_at);
    }

    #[test]
    fn holder_ids_are_unique() {
        let a = new_holder_id();
        let b = new_holder_id();
        assert_ne!(a, b);
    }
}
