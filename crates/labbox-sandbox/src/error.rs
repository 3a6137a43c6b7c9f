//! Error types for sandbox operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while executing a request.
///
/// Script failures (non-zero exit, timeout, rejection) are not errors; they
/// are reported through [`crate::Outcome`]. These variants describe problems
/// with the request itself or with the sandbox environment.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The request is malformed (bad variable name, empty code, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The configured interpreter could not be found on this host.
    #[error("Interpreter unavailable: {message}\n\n{install_hint}")]
    InterpreterUnavailable {
        message: String,
        install_hint: String,
    },

    /// Creating or preparing the working directory failed.
    #[error("Failed to prepare working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A data file could not be staged into the working directory.
    #[error("Failed to stage data file '{variable}' ({reference}): {message}")]
    Staging {
        variable: String,
        reference: String,
        message: String,
    },

    /// The interpreter process could not be spawned.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// An upload or artifact store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid sandbox configuration.
    #[error("Invalid sandbox configuration: {0}")]
    ConfigError(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Create a staging error.
    pub fn staging(
        variable: impl Into<String>,
        reference: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Staging {
            variable: variable.into(),
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the sandbox environment itself is broken,
    /// as opposed to the caller sending a bad request.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_is_not_infrastructure() {
        let err = SandboxError::InvalidRequest("bad variable".to_string());
        assert!(!err.is_infrastructure());
        assert!(err.to_string().contains("bad variable"));
    }

    #[test]
    fn test_staging_error_display() {
        let err = SandboxError::staging("df", "upload-1", "not found");
        assert!(err.is_infrastructure());
        let msg = err.to_string();
        assert!(msg.contains("df"));
        assert!(msg.contains("upload-1"));
        assert!(msg.contains("not found"));
    }
}
