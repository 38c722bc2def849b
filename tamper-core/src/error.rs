//! Error types for proxy operations

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Certificate authority could not be loaded or generated
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// The listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Lifecycle operation not allowed in the current state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Network-related errors raised by the interception engine
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP processing errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Scenario file could not be parsed
    #[error("Scenario error: {0}")]
    Scenario(#[from] serde_json::Error),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while buffering a request or response body
#[derive(Debug, Clone, Error)]
pub enum BodyReadError {
    /// Error reading from the body stream
    #[error("Stream read error: {0}")]
    Stream(String),
    /// The whole body was not received within the configured timeout
    #[error("Body read timeout exceeded")]
    Timeout,
}

impl From<BodyReadError> for ProxyError {
    fn from(err: BodyReadError) -> Self {
        ProxyError::Http(err.to_string())
    }
}
