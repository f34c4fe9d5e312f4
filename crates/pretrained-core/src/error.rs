//! Error types for the pretrained artifact service.
//!
//! Errors are split along the lines callers need to act on: "not found"
//! (a typo, never retried), "unavailable" (transient, retry later) and
//! "corrupt" (safe to retry immediately, no poisoned state remains).

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for the pretrained library.
///
/// The type is `Clone` so a single terminal failure of an in-flight
/// resolution can be handed verbatim to every waiting caller; wrapped
/// sources are therefore held behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum PretrainedError {
    // Resolution errors
    #[error("Artifact not found: {kind} {name} ({language}, {version})")]
    NotFound {
        kind: String,
        name: String,
        language: String,
        version: String,
    },

    #[error("Registry unavailable at {url}: {message}")]
    RegistryUnavailable { url: String, message: String },

    // Download errors
    #[error("Corrupt artifact from {url}: expected {expected}, got {actual}")]
    CorruptArtifact {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Client error {status} for {url}")]
    Client { url: String, status: u16 },

    #[error("Transient network error for {url}: {message}")]
    TransientNetwork { url: String, message: String },

    // Configuration errors
    #[error("Invalid cache path {path:?}: {message}")]
    InvalidPath { path: PathBuf, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // File system errors
    #[error("Disk error at {path:?}: {message}")]
    Disk {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resolution cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for pretrained operations.
pub type Result<T> = std::result::Result<T, PretrainedError>;

/// Coarse classification of a [`PretrainedError`].
///
/// This is the payload carried by the `Failed` resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    RegistryUnavailable,
    CorruptArtifact,
    Client,
    TransientNetwork,
    InvalidPath,
    Disk,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::RegistryUnavailable => "registry_unavailable",
            ErrorKind::CorruptArtifact => "corrupt_artifact",
            ErrorKind::Client => "client",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::Disk => "disk",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for PretrainedError {
    fn from(err: std::io::Error) -> Self {
        PretrainedError::Disk {
            message: err.to_string(),
            path: None,
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for PretrainedError {
    fn from(err: serde_json::Error) -> Self {
        PretrainedError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<reqwest::Error> for PretrainedError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match err.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 => {
                PretrainedError::Client {
                    url,
                    status: status.as_u16(),
                }
            }
            _ => PretrainedError::TransientNetwork {
                url,
                message: err.to_string(),
            },
        }
    }
}

impl PretrainedError {
    /// Create a disk error with path context.
    pub fn disk_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PretrainedError::Disk {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(Arc::new(err)),
        }
    }

    /// Create a disk error with a custom message and path context.
    pub fn disk(message: impl Into<String>, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        PretrainedError::Disk {
            message: format!("{}: {}", message.into(), err),
            path: Some(path.into()),
            source: Some(Arc::new(err)),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PretrainedError::NotFound { .. } => ErrorKind::NotFound,
            PretrainedError::RegistryUnavailable { .. } => ErrorKind::RegistryUnavailable,
            PretrainedError::CorruptArtifact { .. } => ErrorKind::CorruptArtifact,
            PretrainedError::Client { .. } => ErrorKind::Client,
            PretrainedError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            PretrainedError::InvalidPath { .. } => ErrorKind::InvalidPath,
            PretrainedError::Disk { .. } => ErrorKind::Disk,
            PretrainedError::Cancelled => ErrorKind::Cancelled,
            PretrainedError::Config { .. }
            | PretrainedError::Json { .. }
            | PretrainedError::Validation { .. }
            | PretrainedError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error should trigger an internal download retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PretrainedError::TransientNetwork { .. })
    }

    /// Check if the caller may retry the whole resolution later.
    ///
    /// Corrupt artifacts are included: a failed resolution never leaves
    /// partial data behind, so an immediate retry starts clean.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(
            self,
            PretrainedError::RegistryUnavailable { .. }
                | PretrainedError::TransientNetwork { .. }
                | PretrainedError::CorruptArtifact { .. }
                | PretrainedError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PretrainedError::NotFound {
            kind: "model".into(),
            name: "typo_model".into(),
            language: "en".into(),
            version: "latest".into(),
        };
        assert_eq!(
            err.to_string(),
            "Artifact not found: model typo_model (en, latest)"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PretrainedError::Client {
                url: "https://x".into(),
                status: 404
            }
            .kind(),
            ErrorKind::Client
        );
        assert_eq!(PretrainedError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            PretrainedError::Other("boom".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PretrainedError::TransientNetwork {
            url: "https://x".into(),
            message: "reset".into()
        }
        .is_retryable());
        assert!(!PretrainedError::CorruptArtifact {
            url: "https://x".into(),
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
        assert!(!PretrainedError::Client {
            url: "https://x".into(),
            status: 403
        }
        .is_retryable());
    }

    #[test]
    fn test_caller_retry_guidance() {
        assert!(PretrainedError::RegistryUnavailable {
            url: "https://x".into(),
            message: "down".into()
        }
        .is_retryable_by_caller());
        assert!(!PretrainedError::NotFound {
            kind: "model".into(),
            name: "n".into(),
            language: "en".into(),
            version: "latest".into()
        }
        .is_retryable_by_caller());
    }

    #[test]
    fn test_io_error_conversion_is_disk() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PretrainedError = io.into();
        assert_eq!(err.kind(), ErrorKind::Disk);
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }
}
