//! Run-scoped exclusive lock on the state.
//!
//! A lock names its holder and expires after [`LOCK_EXPIRY_SECS`]; an
//! expired lock may be taken over by the next run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::StateError;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// How often a running apply renews its lock.
pub const LOCK_RENEW_INTERVAL_SECS: u64 = 60;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock for `holder`, generating an identity if it is blank.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let holder = if holder.trim().is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Builds the contention error reported to a competing run.
    #[must_use]
    pub fn contention(&self) -> StateError {
        StateError::lock_contention(
            format!(
                "state is locked by {} since {} ({}s remaining)",
                self.holder,
                self.acquired_at.to_rfc3339(),
                self.remaining_secs()
            ),
            Some(self.holder.clone()),
        )
    }

    /// Builds the error reported when this lock is no longer the one the
    /// backend records.
    #[must_use]
    pub fn lost(&self, current: Option<&Self>) -> StateError {
        match current {
            Some(other) => StateError::lock_contention(
                format!("state lock {} was taken over by {}", self.lock_id, other.holder),
                Some(other.holder.clone()),
            ),
            None => StateError::lock_contention(
                format!("state lock {} was released by another run", self.lock_id),
                None,
            ),
        }
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.holder, self.lock_id)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("ci-runner");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_blank_holder_gets_generated_identity() {
        let lock = LockInfo::new("  ");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("old");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_lock_refresh() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        lock.refresh();
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_lost_lock_names_new_holder() {
        let lock = LockInfo::new("run-a");
        let other = LockInfo::new("run-b");
        let StateError::LockContention { holder, .. } = lock.lost(Some(&other)) else {
            panic!("expected lock contention");
        };
        assert_eq!(holder.as_deref(), Some("run-b"));
    }

    #[test]
    fn test_contention_names_holder() {
        let lock = LockInfo::new("alice-laptop");
        let StateError::LockContention { holder, message } = lock.contention() else {
            panic!("expected lock contention");
        };
        assert_eq!(holder.as_deref(), Some("alice-laptop"));
        assert!(message.contains("alice-laptop"));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
