// Error taxonomy for the versioning store
//
// The first four variants are the contract callers match on.
// Everything below them is infrastructure failure from the backend.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for versioning operations.
pub type Result<T> = std::result::Result<T, VersioningError>;

#[derive(Error, Debug)]
pub enum VersioningError {
    /// `create` on an id that already has a current record.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// Operation on an absent or deleted id, or a point in time with no state.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// `at` would reorder history, or cannot be persisted.
    #[error("{kind} '{id}': invalid timestamp {at}: {reason}")]
    InvalidTimestamp {
        kind: &'static str,
        id: String,
        at: DateTime<Utc>,
        reason: String,
    },

    /// Another writer advanced the record first. Re-read and retry.
    #[error("{kind} '{id}' was modified concurrently (expected effective_since {expected})")]
    ConcurrentModification {
        kind: &'static str,
        id: String,
        expected: DateTime<Utc>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend lock poisoned")]
    LockPoisoned,
}

impl VersioningError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        VersioningError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: &str) -> Self {
        VersioningError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_timestamp(
        kind: &'static str,
        id: &str,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        VersioningError::InvalidTimestamp {
            kind,
            id: id.to_string(),
            at,
            reason: reason.into(),
        }
    }

    pub fn conflict(kind: &'static str, id: &str, expected: DateTime<Utc>) -> Self {
        VersioningError::ConcurrentModification {
            kind,
            id: id.to_string(),
            expected,
        }
    }

    /// Only a lost optimistic race is worth retrying with a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VersioningError::ConcurrentModification { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VersioningError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        let now = Utc::now();
        assert!(VersioningError::conflict("realtor", "r1", now).is_retryable());
        assert!(!VersioningError::not_found("realtor", "r1").is_retryable());
        assert!(!VersioningError::already_exists("realtor", "r1").is_retryable());
        assert!(!VersioningError::invalid_timestamp("realtor", "r1", now, "too early").is_retryable());
    }

    #[test]
    fn test_error_messages_name_kind_and_id() {
        let err = VersioningError::not_found("currency_price", "UF");
        assert_eq!(err.to_string(), "currency_price 'UF' not found");

        let err = VersioningError::already_exists("user", "u-1");
        assert_eq!(err.to_string(), "user 'u-1' already exists");
    }
}
