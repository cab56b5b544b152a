//! Error handling for the device link service
//!
//! `LinkError` is the single error type flowing through shims, the connector,
//! the registries and the polling driver. Per-device and per-block failures are
//! contained by the connector; only errors outside that scope reach callers.

use errors::{ErrorCategory, PlcLinkError, PlcLinkErrorTrait};
use thiserror::Error;

/// Device link service error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A shim could not establish a session with its device
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A read was issued against a disconnected or errored device
    #[error("IO error: {0}")]
    IoError(String),

    /// A device or service is missing required configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A shim call did not complete within its time budget
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// A device answered with something the shim cannot interpret
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Invalid request descriptors or malformed boundary payloads
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The storage collaborator rejected a write
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Unexpected failures (panics caught by the polling driver, etc.)
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the device link service
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    pub fn connection(msg: impl Into<String>) -> Self {
        LinkError::ConnectionError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LinkError::IoError(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::ConfigError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LinkError::TimeoutError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::ProtocolError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        LinkError::ValidationError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        LinkError::StorageError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LinkError::InternalError(msg.into())
    }

    // Convenience constructors for specific cases
    pub fn not_connected(device_id: impl std::fmt::Display) -> Self {
        LinkError::IoError(format!("Device {} is not connected", device_id))
    }

    pub fn missing_address(device_id: impl std::fmt::Display) -> Self {
        LinkError::ConfigError(format!("Device {} has no address configured", device_id))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::ValidationError(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for LinkError {
    fn from(err: serde_yaml::Error) -> Self {
        LinkError::ConfigError(format!("YAML: {err}"))
    }
}

impl From<sqlx::Error> for LinkError {
    fn from(err: sqlx::Error) -> Self {
        LinkError::StorageError(format!("SQLite: {err}"))
    }
}

impl From<figment::Error> for LinkError {
    fn from(err: figment::Error) -> Self {
        LinkError::ConfigError(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn storage_error(self, msg: &str) -> Result<T>;
    fn validation_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| LinkError::ConfigError(format!("{msg}: {e}")))
    }

    fn storage_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| LinkError::StorageError(format!("{msg}: {e}")))
    }

    fn validation_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| LinkError::ValidationError(format!("{msg}: {e}")))
    }
}

// ============================================================================
// Conversion from LinkError to PlcLinkError for service boundaries
// ============================================================================

impl From<LinkError> for PlcLinkError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::ConnectionError(msg) | LinkError::IoError(msg) => {
                PlcLinkError::Communication(msg)
            },
            LinkError::ConfigError(msg) => PlcLinkError::Configuration(msg),
            LinkError::TimeoutError(msg) => PlcLinkError::Timeout(msg),
            LinkError::ProtocolError(msg) => PlcLinkError::Protocol {
                protocol: "linksrv".to_string(),
                message: msg,
            },
            LinkError::ValidationError(msg) => PlcLinkError::Validation(msg),
            LinkError::StorageError(msg) => PlcLinkError::Storage(msg),
            LinkError::InternalError(msg) => PlcLinkError::Internal(msg),
        }
    }
}

impl PlcLinkErrorTrait for LinkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => "LINKSRV_CONNECTION_ERROR",
            Self::IoError(_) => "LINKSRV_IO_ERROR",
            Self::ConfigError(_) => "LINKSRV_CONFIG_ERROR",
            Self::TimeoutError(_) => "LINKSRV_TIMEOUT",
            Self::ProtocolError(_) => "LINKSRV_PROTOCOL_ERROR",
            Self::ValidationError(_) => "LINKSRV_VALIDATION_ERROR",
            Self::StorageError(_) => "LINKSRV_STORAGE_ERROR",
            Self::InternalError(_) => "LINKSRV_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionError(_) => ErrorCategory::Connection,
            Self::IoError(_) => ErrorCategory::Network,
            Self::ConfigError(_) => ErrorCategory::Configuration,
            Self::TimeoutError(_) => ErrorCategory::Timeout,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::ValidationError(_) => ErrorCategory::Validation,
            Self::StorageError(_) => ErrorCategory::Storage,
            Self::InternalError(_) => ErrorCategory::Internal,
        }
    }
}
