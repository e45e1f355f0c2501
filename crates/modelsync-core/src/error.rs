//! Error types for the model sync daemon.
//!
//! Every error maps onto one of four classes that decide how the daemon
//! reacts: stop at startup, retry next cycle, or log and carry on.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// How the daemon treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing or invalid configuration. Fatal at startup only.
    ConfigFatal,
    /// Network, timeout, or local I/O trouble. Retried next cycle.
    Retryable,
    /// Size or checksum mismatch. Staging is discarded and retried like I/O.
    Verification,
    /// Ambiguous or inconsistent state. Logged and resolved best-effort.
    Conflict,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::ConfigFatal => write!(f, "config_fatal"),
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Verification => write!(f, "verification"),
            ErrorClass::Conflict => write!(f, "conflict"),
        }
    }
}

/// Main error type for the sync daemon.
#[derive(Debug, Error)]
pub enum SyncError {
    // Configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid model name: {0}")]
    InvalidModelName(String),

    // Remote store
    #[error("Remote store error: {message}")]
    Remote {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Remote request timed out: {0}")]
    Timeout(String),

    #[error("Remote path not found: {0}")]
    RemoteNotFound(String),

    #[error("Permission denied on remote path: {0}")]
    RemotePermissionDenied(String),

    #[error("No namenode available for {nameservice}: {message}")]
    NoNamenodeAvailable {
        nameservice: String,
        message: String,
    },

    #[error("Unsupported remote scheme: {0}")]
    UnsupportedScheme(String),

    // Local file system
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Insufficient disk space at {path}: need {required} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Unsafe relative path in manifest: {0}")]
    UnsafePath(String),

    #[error("Local root is locked by another process: {0}")]
    RootLocked(PathBuf),

    // Verification
    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // Conflicts
    #[error("Conflict: {message}")]
    Conflict { message: String },

    // Serialization
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("YAML error: {message}")]
    Yaml {
        message: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    // Lifecycle
    #[error("A sync pass is already running")]
    PassInProgress,

    #[error("Operation aborted by shutdown")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::Yaml {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else {
            SyncError::Remote {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl SyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }

    /// Classify this error for the daemon loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Config { .. }
            | SyncError::UnsupportedScheme(_)
            | SyncError::RootLocked(_) => ErrorClass::ConfigFatal,

            SyncError::SizeMismatch { .. } | SyncError::ChecksumMismatch { .. } => {
                ErrorClass::Verification
            }

            SyncError::Conflict { .. }
            | SyncError::InvalidModelName(_)
            | SyncError::UnsafePath(_)
            | SyncError::PassInProgress => ErrorClass::Conflict,

            _ => ErrorClass::Retryable,
        }
    }

    /// Whether a failed remote call is worth repeating immediately.
    ///
    /// Not-found and permission errors are fatal for the call; the loop still
    /// tries again next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Remote { .. }
                | SyncError::Timeout(_)
                | SyncError::NoNamenodeAvailable { .. }
        )
    }

    /// Whether the remote path itself is missing or forbidden.
    pub fn is_fatal_io(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteNotFound(_) | SyncError::RemotePermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::ChecksumMismatch {
            path: "saved_model.pb".into(),
            expected: "abc123".into(),
            actual: "def456".into(),
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch for saved_model.pb: expected abc123, got def456"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(SyncError::config("missing root").class(), ErrorClass::ConfigFatal);
        assert_eq!(
            SyncError::SizeMismatch {
                path: "a".into(),
                expected: 1,
                actual: 2
            }
            .class(),
            ErrorClass::Verification
        );
        assert_eq!(
            SyncError::Conflict {
                message: "duplicate version".into()
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            SyncError::Timeout("list".into()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            SyncError::RemoteNotFound("/models".into()).class(),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Timeout("open".into()).is_retryable());
        assert!(!SyncError::RemoteNotFound("/models/a".into()).is_retryable());
        assert!(SyncError::RemotePermissionDenied("/models".into()).is_fatal_io());
    }
}
