/// Snapshot of one row of the lock registry.
///
/// `locked` and `ttl_deadline` are nullable in storage; a record fresh from
/// creation is `{locked: false, ttl_deadline: None}`. Conditional updates
/// are guarded against the exact values of a previously read snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub command: String,
    pub locked: Option<bool>,
    /// Epoch seconds after which a held lock counts as abandoned.
    pub ttl_deadline: Option<i64>,
}

impl LockRecord {
    /// True when the lock is held and its deadline has not passed yet.
    /// An expired deadline (or none at all) makes the record reclaimable
    /// even while `locked` is still set, which is how a crashed holder
    /// heals itself.
    pub fn is_held_at(&self, now: i64) -> bool {
        self.locked == Some(true) && self.ttl_deadline.map(|ttl| now < ttl).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(locked: Option<bool>, ttl_deadline: Option<i64>) -> LockRecord {
        LockRecord {
            command: "job:test".to_string(),
            locked,
            ttl_deadline,
        }
    }

    #[test]
    fn test_held_while_deadline_in_future() {
        assert!(record(Some(true), Some(2000)).is_held_at(1000));
    }

    #[test]
    fn test_expired_deadline_is_not_held() {
        assert!(!record(Some(true), Some(1000)).is_held_at(1000));
        assert!(!record(Some(true), Some(500)).is_held_at(1000));
    }

    #[test]
    fn test_locked_without_deadline_is_not_held() {
        assert!(!record(Some(true), None).is_held_at(1000));
    }

    #[test]
    fn test_unlocked_is_not_held() {
        assert!(!record(Some(false), Some(2000)).is_held_at(1000));
        assert!(!record(None, Some(2000)).is_held_at(1000));
    }
}
