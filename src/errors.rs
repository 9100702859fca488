//! Core Error Taxonomy
//! Mission: One error language across all services, mapped to HTTP at the edge
//!
//! Classification drives retry policy:
//! - Validation / TenantMismatch / Forbidden: never retried
//! - Conflict / AlreadyCompleted / NotFound: expected during replay, swallowed
//! - Transient: bubbles up, outbox row stays pending for a later sweep
//! - Poison / UnknownEventType: dead-lettered

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad input or missing identifiers. Surfaced as 400.
    Validation(String),
    /// Resource belongs to another tenant. Surfaced as 403, audited.
    TenantMismatch { expected: String, got: String },
    /// Role rank too low for the operation. Surfaced as 403.
    Forbidden(String),
    /// Missing resource. 404 for reads; a silent no-op inside handlers.
    NotFound(String),
    /// Unique-key race lost to another writer. Swallowed on replay paths.
    Conflict(String),
    /// Aggregate already frozen and no recalculate flag was set.
    AlreadyCompleted(String),
    /// I/O, timeout or DB serialization failure. Retryable.
    Transient(String),
    /// Permanent handler failure. Routed to the dead-letter store.
    Poison(String),
    /// Envelope names a type the registry has never seen.
    UnknownEventType(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        CoreError::Transient(msg.into())
    }

    /// True when a later dispatch sweep may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// True when a handler should treat the error as a silent no-op.
    pub fn is_replay_noop(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict(_) | CoreError::AlreadyCompleted(_) | CoreError::NotFound(_)
        )
    }

    /// True when the event can never be processed and belongs in the DLQ.
    pub fn is_poison(&self) -> bool {
        matches!(self, CoreError::Poison(_) | CoreError::UnknownEventType(_))
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Validation(msg) => write!(f, "validation: {}", msg),
            CoreError::TenantMismatch { expected, got } => {
                write!(f, "tenant mismatch: resource={} caller={}", expected, got)
            }
            CoreError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            CoreError::NotFound(msg) => write!(f, "not found: {}", msg),
            CoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            CoreError::AlreadyCompleted(msg) => write!(f, "already completed: {}", msg),
            CoreError::Transient(msg) => write!(f, "transient: {}", msg),
            CoreError::Poison(msg) => write!(f, "poison event: {}", msg),
            CoreError::UnknownEventType(name) => write!(f, "unknown event type: {}", name),
        }
    }
}

impl std::error::Error for CoreError {}

/// Map a sqlite failure onto the taxonomy. Unique-constraint violations are
/// conflicts (another writer won); everything else is transient.
pub fn classify_sqlite(err: rusqlite::Error) -> CoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CoreError::Conflict(err.to_string())
        }
        _ => CoreError::Transient(err.to_string()),
    }
}

/// Pull a `CoreError` back out of an `anyhow` chain, if one is there.
pub fn as_core(err: &anyhow::Error) -> Option<&CoreError> {
    err.downcast_ref::<CoreError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(CoreError::transient("db busy").is_retryable());
        assert!(CoreError::Conflict("dup".into()).is_replay_noop());
        assert!(CoreError::AlreadyCompleted("hour".into()).is_replay_noop());
        assert!(CoreError::UnknownEventType("Bogus".into()).is_poison());
        assert!(!CoreError::validation("bad").is_retryable());
    }

    #[test]
    fn test_anyhow_round_trip() {
        let err = anyhow::Error::new(CoreError::NotFound("station".into()));
        assert_eq!(as_core(&err), Some(&CoreError::NotFound("station".into())));
    }

    #[test]
    fn test_sqlite_classification() {
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed".into()),
        );
        assert!(matches!(classify_sqlite(constraint), CoreError::Conflict(_)));
    }
}
