//! Error taxonomy shared by every availability subsystem.

use std::collections::HashSet;
use std::sync::{LazyLock, Mutex};

use thiserror::Error;
use tracing::warn;

/// Result type alias for availability operations.
pub type AvailResult<T> = Result<T, AvailError>;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lookup of an unknown name or id. Recoverable; the caller decides.
    NotFound,
    /// A non-blocking read found nothing. Expected, never logged as an error.
    NoMsg,
    /// A feature path that is not wired up. Logged at most once.
    NotImplemented,
    /// Terminal for this operation. Always logged with context.
    Failed,
}

#[derive(Debug, Error)]
pub enum AvailError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no message available")]
    NoMsg,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("{table} table full (capacity {capacity})")]
    TableFull { table: &'static str, capacity: usize },

    #[error("{fsm} fsm: event '{event}' not handled in state '{state}'")]
    InvalidTransition {
        fsm: &'static str,
        state: String,
        event: String,
    },
}

impl AvailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AvailError::NotFound(_) => ErrorKind::NotFound,
            AvailError::NoMsg => ErrorKind::NoMsg,
            AvailError::NotImplemented(_) => ErrorKind::NotImplemented,
            AvailError::Failed(_)
            | AvailError::TableFull { .. }
            | AvailError::InvalidTransition { .. } => ErrorKind::Failed,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        AvailError::Failed(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AvailError::NotFound(what.into())
    }

    pub fn invalid_transition(
        fsm: &'static str,
        state: impl ToString,
        event: impl ToString,
    ) -> Self {
        AvailError::InvalidTransition {
            fsm,
            state: state.to_string(),
            event: event.to_string(),
        }
    }
}

static NOT_IMPLEMENTED_SEEN: LazyLock<Mutex<HashSet<&'static str>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Log a not-implemented feature path the first time it is taken. Returns
/// whether this call logged.
pub fn log_not_implemented(feature: &'static str) -> bool {
    let first = NOT_IMPLEMENTED_SEEN
        .lock()
        .map(|mut seen| seen.insert(feature))
        .unwrap_or(false);
    if first {
        warn!(%feature, "not implemented");
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_full_and_invalid_transition_are_failed() {
        let full = AvailError::TableFull { table: "timers", capacity: 4 };
        assert_eq!(full.kind(), ErrorKind::Failed);
        let bad = AvailError::invalid_transition("service", "disabled", "go-active-success");
        assert_eq!(bad.kind(), ErrorKind::Failed);
        assert!(bad.to_string().contains("go-active-success"));
    }

    #[test]
    fn not_implemented_logs_once() {
        assert!(log_not_implemented("test-feature"));
        assert!(!log_not_implemented("test-feature"));
    }
}
