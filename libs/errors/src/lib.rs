//! Unified error handling for PlcLink services
//!
//! Every service keeps its own domain error type (e.g. `LinkError` in linksrv)
//! and exposes it to the outside world through [`PlcLinkErrorTrait`] and a
//! conversion into [`PlcLinkError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ErrorInfo - serializable error summary
// ============================================================================

/// Serializable error summary, suitable for status endpoints and event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code, e.g. `LINKSRV_CONNECTION_ERROR`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Whether a caller may retry the failed operation
    pub retryable: bool,
}

impl ErrorInfo {
    /// Build an ErrorInfo from any classified error
    pub fn from_error<E: PlcLinkErrorTrait>(err: &E) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

// ============================================================================
// PlcLinkError - Main error type
// ============================================================================

/// Main error type at service boundaries (binary entry points, task joins)
#[derive(Debug, Error)]
pub enum PlcLinkError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // Storage & Validation Errors
    // ======================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // ======================================
    // Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using PlcLinkError
pub type PlcLinkResult<T> = Result<T, PlcLinkError>;

impl PlcLinkErrorTrait for PlcLinkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIG_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Communication(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::StartupFailed(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

// ============================================================================
// PlcLink Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Storage,
    Network,
    Timeout,

    // Business logic layer
    Validation,

    // Protocol/communication layer
    Protocol,
    Connection,

    // System level
    Internal,
}

/// PlcLink error capability trait
///
/// Each service keeps its own domain error type and gains a common outward
/// interface by implementing this trait.
pub trait PlcLinkErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and event payloads)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::Storage
        )
    }

    /// Level at which a failure of this kind is logged
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Storage => Level::ERROR,
            ErrorCategory::Validation => Level::INFO,
            ErrorCategory::Configuration
            | ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol => Level::WARN,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(PlcLinkError::Timeout("plc-1".into()).is_retryable());
        assert!(PlcLinkError::Storage("disk full".into()).is_retryable());
        assert!(!PlcLinkError::Validation("bad".into()).is_retryable());
        assert!(!PlcLinkError::Configuration("missing".into()).is_retryable());
    }

    #[test]
    fn test_log_level_follows_category() {
        use tracing::Level;
        assert_eq!(PlcLinkError::Storage("x".into()).log_level(), Level::ERROR);
        assert_eq!(PlcLinkError::Timeout("x".into()).log_level(), Level::WARN);
        assert_eq!(PlcLinkError::Validation("x".into()).log_level(), Level::INFO);
    }

    #[test]
    fn test_error_info() {
        let error = PlcLinkError::Communication("10.0.0.1:502 unreachable".into());
        let info = ErrorInfo::from_error(&error);
        assert_eq!(info.code, "COMMUNICATION_ERROR");
        assert!(info.retryable);
        assert!(info.message.contains("10.0.0.1:502"));
    }
}
