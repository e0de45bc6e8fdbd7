//! Engine error taxonomy.
//!
//! One enum covers the whole pipeline so retry policy can be decided by
//! matching on the kind rather than downcasting. Variants are serializable
//! and do not wrap `std::io::Error` directly; I/O errors capture the kind
//! and message as strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the acquisition/download/placement pipeline.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineError {
    /// Upstream rate limit; retry after the advertised wait.
    #[error("flood wait: retry after {seconds}s")]
    FloodWait {
        /// Seconds the remote asked us to wait.
        seconds: u64,
    },

    /// Transient transport failure (reconnects, timeouts, 5xx-style).
    #[error("transport error: {message}")]
    Transport {
        /// Detailed error message.
        message: String,
    },

    /// Downloaded bytes exceed the advertised size.
    #[error("corrupted download: expected {expected} bytes, got {actual}")]
    Corrupted {
        /// Authoritative size from the remote artifact.
        expected: u64,
        /// Size observed on disk.
        actual: u64,
    },

    /// Admission control: not enough free space on the filesystem.
    #[error("disk full: {free_pct}% free under {folder}")]
    DiskFull {
        /// Folder whose filesystem failed the check.
        folder: String,
        /// Free percentage after deducting the artifact size.
        free_pct: u8,
    },

    /// Target folder is missing or the supplied path is not acceptable.
    #[error("invalid target folder: {path}")]
    InvalidTarget {
        /// The offending path.
        path: String,
    },

    /// Local filesystem failure; terminal for the job.
    #[error("I/O error ({kind}): {message}")]
    Io {
        /// The kind of I/O error (e.g., "NotFound", "PermissionDenied").
        kind: String,
        /// Detailed error message.
        message: String,
    },

    /// A rule file failed validation at load time.
    #[error("rule validation: {message}")]
    RuleValidation {
        /// What the loader rejected.
        message: String,
    },

    /// Operation was cancelled (operator stop or shutdown).
    #[error("cancelled")]
    Cancelled,

    /// Anything else; terminal, preserved for diagnosis.
    #[error("{message}")]
    Other {
        /// Error message.
        message: String,
    },
}

impl EngineError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an I/O error from a `std::io::Error`.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        Self::Io {
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }

    /// Create a rule validation error.
    pub fn rule_validation(message: impl Into<String>) -> Self {
        Self::RuleValidation {
            message: message.into(),
        }
    }

    /// Create an invalid target error.
    pub fn invalid_target(path: impl Into<String>) -> Self {
        Self::InvalidTarget { path: path.into() }
    }

    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether the retry loop should try again after a wait.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::FloodWait { .. } | Self::Transport { .. })
    }

    /// Whether this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err)
    }
}

/// Convenience result type for pipeline operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_captures_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = EngineError::from_io(&io);
        match err {
            EngineError::Io { kind, message } => {
                assert_eq!(kind, "PermissionDenied");
                assert!(message.contains("denied"));
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(EngineError::FloodWait { seconds: 7 }.is_transient());
        assert!(EngineError::transport("reset").is_transient());
        assert!(!EngineError::Cancelled.is_transient());
        assert!(
            !EngineError::Io {
                kind: "NotFound".into(),
                message: "gone".into()
            }
            .is_transient()
        );
        assert!(
            !EngineError::Corrupted {
                expected: 10,
                actual: 20
            }
            .is_transient()
        );
    }

    #[test]
    fn serializes_round_trip() {
        let err = EngineError::DiskFull {
            folder: "/media".into(),
            free_pct: 3,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: EngineError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
