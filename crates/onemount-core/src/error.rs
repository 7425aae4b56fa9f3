//! Error taxonomy and errno mapping.
//!
//! Component boundaries speak in kinds, not sources: retry loops need
//! to know *transient or not*, the dispatcher needs an errno, and the
//! status layer needs a message. Transient failures are absorbed by
//! the retry loops in the transfer managers; everything else surfaces
//! here and is mapped for the kernel.

use thiserror::Error;

/// Errors crossing component boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Item does not exist locally or remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// Case-insensitive name collision at the target parent.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Remote returned 401/403 after a refresh attempt.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Remote reported insufficient storage.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// Network / 5xx / rate-limit failure; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// A state transition not permitted by the item state machine.
    /// Indicates a programming error; logged, never sent to the kernel.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Post-transfer verification failed.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Remote change collided with a local mutation.
    #[error("conflict on {0}")]
    Conflict(String),

    /// Caller or deadline terminated the operation.
    #[error("cancelled")]
    Cancelled,

    /// Directory removal requires an empty child set.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Sentinel or malformed name.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Malformed QuickXOR wire form.
    #[error("invalid hash: {0:?}")]
    InvalidHash(String),

    /// Content for a ghost item requested while offline.
    #[error("not available offline: {0}")]
    Offline(String),

    /// Local I/O failure.
    #[error("io error: {0}")]
    Io(String),

    /// Metadata store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// POSIX errno the dispatcher reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::NotFound(_) => libc::ENOENT,
            CoreError::AlreadyExists(_) => libc::EEXIST,
            CoreError::PermissionDenied(_) => libc::EACCES,
            CoreError::OutOfSpace(_) => libc::ENOSPC,
            CoreError::NotEmpty(_) => libc::ENOTEMPTY,
            CoreError::InvalidName(_) | CoreError::InvalidHash(_) => libc::EINVAL,
            CoreError::Transient(_)
            | CoreError::ChecksumMismatch { .. }
            | CoreError::Cancelled
            | CoreError::Conflict(_)
            | CoreError::Offline(_)
            | CoreError::Io(_)
            | CoreError::Storage(_) => libc::EIO,
            // Programming error; should have been logged long before
            // reaching the kernel boundary.
            CoreError::InvalidTransition { .. } => libc::EIO,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => CoreError::AlreadyExists(e.to_string()),
            std::io::ErrorKind::PermissionDenied => CoreError::PermissionDenied(e.to_string()),
            _ => CoreError::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(CoreError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(CoreError::AlreadyExists("x".into()).errno(), libc::EEXIST);
        assert_eq!(CoreError::PermissionDenied("x".into()).errno(), libc::EACCES);
        assert_eq!(CoreError::OutOfSpace("x".into()).errno(), libc::ENOSPC);
        assert_eq!(CoreError::NotEmpty("d".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(CoreError::InvalidName(".".into()).errno(), libc::EINVAL);
        assert_eq!(CoreError::Cancelled.errno(), libc::EIO);
        assert_eq!(
            CoreError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::Transient("503".into()).is_transient());
        assert!(!CoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let e: CoreError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, CoreError::NotFound(_)));
    }
}
