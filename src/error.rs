//! Custom error types for devloop.
//!
//! Sandbox test failures are deliberately absent from this taxonomy: a
//! non-zero exit code drives the repair loop forward and is never an error.
//! Everything here aborts the run.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for devloop operations
#[derive(Error, Debug)]
pub enum DevloopError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Requested environment template is not in the registry
    #[error("Unknown template name '{name}'. Must be one of: {}", available.join(", "))]
    UnknownTemplate {
        name: String,
        available: Vec<String>,
    },

    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Oracle Errors
    // =========================================================================
    /// Every attempt allowed by the retry policy failed
    #[error("Oracle call '{operation}' failed after {attempts} attempts: {last_error}")]
    OracleExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Oracle response did not have the mandatory shape
    #[error("Malformed output from '{operation}': {detail}")]
    MalformedOracleOutput { operation: String, detail: String },

    /// A structured repair field failed validation
    #[error("Invalid repair plan: {detail}")]
    InvalidRepairPlan { detail: String },

    /// A code generation task failed
    #[error("Generating '{file_path}' failed: {message}")]
    GenerationFailed { file_path: String, message: String },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    /// The sandbox backend cannot be used at all
    #[error("Sandbox unavailable: {detail}")]
    SandboxUnavailable { detail: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DevloopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed oracle output error
    pub fn malformed(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedOracleOutput {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Create an invalid repair plan error
    pub fn invalid_plan(detail: impl Into<String>) -> Self {
        Self::InvalidRepairPlan {
            detail: detail.into(),
        }
    }

    /// Create a sandbox unavailable error
    pub fn sandbox_unavailable(detail: impl Into<String>) -> Self {
        Self::SandboxUnavailable {
            detail: detail.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Whether the retry wrapper should re-issue the call that produced this error.
    ///
    /// Configuration mistakes are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownTemplate { .. }
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::OracleExhausted { .. }
                | Self::SandboxUnavailable { .. }
        )
    }

    /// Whether this error must end the run even inside a retry loop.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Check if this error is a caller/configuration mistake
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTemplate { .. } | Self::Config { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownTemplate { .. } => 2,
            Self::OracleExhausted { .. } => 3,
            Self::SandboxUnavailable { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for devloop results
pub type Result<T> = std::result::Result<T, DevloopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_template_lists_choices() {
        let err = DevloopError::UnknownTemplate {
            name: "cobol".into(),
            available: vec!["python".into(), "rust".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cobol"));
        assert!(msg.contains("python, rust"));
    }

    #[test]
    fn test_exhausted_display() {
        let err = DevloopError::OracleExhausted {
            operation: "plan".into(),
            attempts: 8,
            last_error: "rate limited".into(),
        };
        assert!(err.to_string().contains("after 8 attempts"));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(DevloopError::malformed("plan", "not a string").is_retryable());
        assert!(DevloopError::invalid_plan("bad path").is_retryable());
        assert!(!DevloopError::config("bad").is_retryable());
        assert!(DevloopError::sandbox_unavailable("no docker").is_fatal());
        assert!(!DevloopError::UnknownTemplate {
            name: "x".into(),
            available: vec![],
        }
        .is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            DevloopError::UnknownTemplate {
                name: "x".into(),
                available: vec![],
            }
            .exit_code(),
            2
        );
        assert_eq!(DevloopError::config("test").exit_code(), 7);
        assert_eq!(DevloopError::sandbox_unavailable("no docker").exit_code(), 6);
        assert_eq!(DevloopError::malformed("plan", "x").exit_code(), 1);
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/devloop.toml");
        let err = DevloopError::config_with_path("failed to parse", path.clone());
        if let DevloopError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: DevloopError = io_err.into();
        assert!(matches!(err, DevloopError::Io(_)));
        assert!(err.to_string().contains("access denied"));
        assert!(!err.is_config_error());
    }
}
