//! # Error Types
//!
//! Custom error types for Roadsense Logger using `thiserror`.

use thiserror::Error;

/// Main error type for Roadsense Logger
#[derive(Debug, Error)]
pub enum RoadsenseError {
    /// Station string is not of the form `km+m`
    #[error("Invalid station format: {0:?}")]
    InvalidStationFormat(String),

    /// Line protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `connect()` was issued while a connection attempt is already running
    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    /// No device candidate appeared within the discovery window
    #[error("No survey device found (tried: {0})")]
    DeviceNotFound(String),

    /// Serial transport errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// Persistence errors reported by an ingestion sink
    #[error("Storage error: {0}")]
    Storage(String),

    /// Domain validation errors (empty project name, bad survey settings)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The link manager worker has shut down
    #[error("Link manager is no longer running")]
    ManagerClosed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Roadsense Logger
pub type Result<T> = std::result::Result<T, RoadsenseError>;
