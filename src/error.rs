//! Error types for skysync
//!
//! This module defines all error types used throughout the application,
//! including the capability-mismatch signals that optional backend
//! interfaces return to request a generic fallback.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for skysync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during storage operations
    #[error("I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Named remote absent from the config file
    #[error("Didn't find section '{0}' in config file")]
    NotFoundInConfig(String),

    /// Remote type named in the config file has no registered backend
    #[error("Unknown storage backend type '{0}'")]
    UnknownBackendType(String),

    /// Object not found on the backend
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Directory (container, bucket) not found
    #[error("Directory not found: {0}")]
    DirNotFound(String),

    /// Rmdir on a non-empty directory
    #[error("Directory not empty: {0}")]
    DirNotEmpty(String),

    /// Server-side copy not possible between these remotes
    #[error("Can't copy object - incompatible remotes")]
    CantCopy,

    /// Server-side move not possible between these remotes
    #[error("Can't move object - incompatible remotes")]
    CantMove,

    /// Server-side directory move not possible between these remotes
    #[error("Can't move directory - incompatible remotes")]
    CantDirMove,

    /// Directory move refused because the destination already exists
    #[error("Can't copy directory - destination already exists")]
    DirExists,

    /// Purge not supported by this remote
    #[error("Can't purge directory")]
    CantPurge,

    /// Listing was aborted by the consumer
    #[error("List aborted")]
    ListAborted,

    /// Backend reported an inconsistent listing (mid-delta reset, object
    /// outside the declared root)
    #[error("Listing inconsistency: {0}")]
    ListingInconsistency(String),

    /// Object was written but came back with the wrong size or hash
    #[error("Corrupted on transfer for '{remote}': {detail}")]
    CorruptedTransfer { remote: String, detail: String },

    /// Name the destination backend will never accept
    #[error("Can't upload disallowed name: {0}")]
    DisallowedName(String),

    /// Invalid remote path syntax
    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Filter rule could not be parsed or compiled
    #[error("Invalid filter rule '{rule}': {reason}")]
    FilterRule { rule: String, reason: String },

    /// In-flight transfer saw no data for longer than --timeout
    #[error("Transfer timed out after {0} seconds of inactivity")]
    TransferTimeout(u64),

    /// The run finished with per-object errors recorded in stats
    #[error("Run failed with {0} error(s)")]
    RunFailed(u64),
}

impl SyncError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a corrupted-transfer error
    pub fn corrupted(remote: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CorruptedTransfer {
            remote: remote.into(),
            detail: detail.into(),
        }
    }

    /// Whether a whole-run retry could plausibly clear this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ListAborted
                | Self::ListingInconsistency(_)
                | Self::CorruptedTransfer { .. }
                | Self::TransferTimeout(_)
                | Self::RunFailed(_)
        )
    }

    /// Capability-mismatch signals that callers resolve with a fallback
    /// rather than by reporting failure
    pub fn is_capability_miss(&self) -> bool {
        matches!(
            self,
            Self::CantCopy | Self::CantMove | Self::CantDirMove | Self::CantPurge
        )
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Result type alias for skysync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| SyncError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = SyncError::io("/test/path", io_err);
        assert_eq!(err.path().unwrap(), &PathBuf::from("/test/path"));
    }

    #[test]
    fn test_capability_miss() {
        assert!(SyncError::CantCopy.is_capability_miss());
        assert!(SyncError::CantMove.is_capability_miss());
        assert!(!SyncError::ListAborted.is_capability_miss());
    }

    #[test]
    fn test_retryability() {
        assert!(SyncError::TransferTimeout(300).is_retryable());
        assert!(!SyncError::NotFoundInConfig("s3".into()).is_retryable());
        assert!(!SyncError::DisallowedName("thumbs.db".into()).is_retryable());
    }
}
