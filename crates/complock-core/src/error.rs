//! Error types for Complock

use thiserror::Error;

use crate::domain::locking::LockError;

/// Result type alias using Complock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Complock error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Entity errors (E001-E099)
    #[error("Lease for component '{0}' not found. Run `complock leases list` to see active leases.")]
    LeaseNotFound(String),

    // Lock errors (E300-E399)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::LeaseNotFound(_) => "E001",
            Self::Lock(inner) => inner.code(),
            Self::DatabaseError(_) => "E400",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::LeaseNotFound(_) => Some("complock leases list".to_string()),
            Self::Lock(LockError::NoSuchLock(id)) => {
                Some(format!("complock leases show {}", id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_keep_their_code() {
        let err: Error = LockError::NoSuchLock("c1".to_string()).into();
        assert_eq!(err.code(), "E302");
        assert_eq!(err.to_string(), "No lock registered for component 'c1'");
        assert_eq!(err.suggestion().as_deref(), Some("complock leases show c1"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::LeaseNotFound("x".into()).code(), "E001");
        assert_eq!(Error::DatabaseError(sqlx::Error::RowNotFound).code(), "E400");
        assert_eq!(Error::InvalidInput("bad".into()).code(), "E800");
        assert_eq!(Error::Other("boom".into()).code(), "E9999");
    }

    #[test]
    fn test_suggestions() {
        assert_eq!(
            Error::LeaseNotFound("c1".into()).suggestion(),
            Some("complock leases list".to_string())
        );
        assert!(Error::InvalidInput("x".into()).suggestion().is_none());
    }
}
