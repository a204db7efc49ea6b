// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the client
///
/// Uses thiserror for ergonomic error handling and automatic Display impl.
/// All errors are serializable so callers can forward them across process
/// boundaries unchanged.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// Implement conversions from common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Network(err.to_string())
    }
}
