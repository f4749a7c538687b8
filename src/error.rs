use std::time::Duration;

use thiserror::Error;

/// Error kinds the retry policy matches on. Workers never match on message
/// text except through the database classifier below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    RateLimited,
    CircuitOpen,
    Timeout,
    UpstreamBlocked,
    UpstreamSchemaChanged,
    TransientDb,
    PermanentDb,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::TransientDb
                | ErrorKind::UpstreamBlocked
        )
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited by {source_name}, retry in {wait_ms}ms")]
    RateLimited { source_name: String, wait_ms: u64 },
    #[error("circuit open for source {0}")]
    CircuitOpen(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("upstream blocked the request: {0}")]
    UpstreamBlocked(String),
    #[error("upstream markup changed: {0}")]
    UpstreamSchemaChanged(String),
    #[error("transient database error: {0}")]
    TransientDb(String),
    #[error("permanent database error: {0}")]
    PermanentDb(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::UpstreamBlocked(_) => ErrorKind::UpstreamBlocked,
            Error::UpstreamSchemaChanged(_) => ErrorKind::UpstreamSchemaChanged,
            Error::TransientDb(_) => ErrorKind::TransientDb,
            Error::PermanentDb(_) => ErrorKind::PermanentDb,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn timeout_after(what: &str, after: Duration) -> Self {
        Error::Timeout(format!("{} after {:?}", what, after))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Patterns that must never be retried. Checked before the transient
/// patterns: "password authentication failed" also contains "authentication",
/// and a retry storm against an auth-rejecting primary is the worst outcome
/// a classifier can produce.
fn is_permanent_db_message(lower: &str) -> bool {
    if lower.contains("password authentication failed")
        || lower.contains("permission denied")
        || lower.contains("p1000")
        || lower.contains("p1003")
    {
        return true;
    }
    // "role ... does not exist" / "database ... does not exist", but not
    // "prepared statement ... does not exist" which is a poisoned pooled
    // connection and recovers on reconnect.
    lower.contains("does not exist")
        && (lower.contains("role") || lower.contains("database"))
        && !lower.contains("prepared statement")
}

const TRANSIENT_DB_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "pool timeout",
    "timed out",
    "timeout expired",
    "can't reach database",
    "prepared statement",
    "terminating connection",
    "too many clients",
    "the database system is starting up",
    "p1001",
    "p1002",
    "p1008",
    "p1017",
    "p2024",
    "p2028",
];

/// Message-substring classifier for errors surfaced by the database driver
/// and its control plane. Everything that is neither recognizably permanent
/// nor recognizably transient is treated as non-transient.
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    if is_permanent_db_message(&lower) {
        return false;
    }
    TRANSIENT_DB_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Map a diesel error onto the taxonomy. Unique violations become
/// `Conflict` so processors can distinguish a natural-key dedup hit from a
/// real failure.
pub fn classify_diesel_error(err: diesel::result::Error) -> Error {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};
    match err {
        DieselError::NotFound => Error::NotFound("record not found".into()),
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            Error::Conflict(info.message().to_string())
        }
        DieselError::DatabaseError(_, info) => {
            let message = info.message().to_string();
            if is_transient(&message) {
                Error::TransientDb(message)
            } else if is_permanent_db_message(&message.to_ascii_lowercase()) {
                Error::PermanentDb(message)
            } else {
                Error::Internal(anyhow::anyhow!("database error: {}", message))
            }
        }
        other => {
            let message = other.to_string();
            if is_transient(&message) {
                Error::TransientDb(message)
            } else {
                Error::Internal(anyhow::anyhow!(other))
            }
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        classify_diesel_error(err)
    }
}

impl From<mobc::Error<diesel::ConnectionError>> for Error {
    fn from(err: mobc::Error<diesel::ConnectionError>) -> Self {
        match err {
            mobc::Error::Timeout => Error::TransientDb("connection pool timeout".into()),
            mobc::Error::Inner(inner) => {
                let message = inner.to_string();
                if is_transient(&message) {
                    Error::TransientDb(message)
                } else {
                    Error::PermanentDb(message)
                }
            }
            other => Error::TransientDb(other.to_string()),
        }
    }
}

// Redis hiccups (reconnects, loading, failovers) retry on the same policy
// as transient database errors.
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Error::Timeout(format!("redis: {}", err))
        } else {
            Error::TransientDb(format!("redis: {}", err))
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() {
            Error::Timeout(format!("connect: {}", err))
        } else {
            Error::UpstreamBlocked(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_not_transient() {
        assert!(!is_transient("password authentication failed for user X"));
        assert!(!is_transient("FATAL: permission denied for database cw"));
        assert!(!is_transient("role \"cw_worker\" does not exist"));
        assert!(!is_transient("database \"cw\" does not exist"));
    }

    #[test]
    fn pool_and_network_failures_are_transient() {
        assert!(is_transient("connection pool timeout"));
        assert!(is_transient("Connection refused (os error 111)"));
        assert!(is_transient("can't reach database server at db:5432"));
        assert!(is_transient("prepared statement \"s0\" does not exist"));
    }

    #[test]
    fn control_plane_codes() {
        assert!(is_transient("P1001"));
        assert!(is_transient("P1002"));
        assert!(is_transient("P2024"));
        assert!(!is_transient("P1000"));
        assert!(!is_transient("P1003"));
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::TransientDb.is_retryable());
        assert!(ErrorKind::UpstreamBlocked.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::UpstreamSchemaChanged.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::PermanentDb.is_retryable());
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        let err = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key value violates unique constraint".to_string()),
        );
        assert_eq!(classify_diesel_error(err).kind(), ErrorKind::Conflict);
    }
}
