//! WolfGroup Error Types

use thiserror::Error;

/// Result type alias for WolfGroup operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfGroup error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Coordination store errors
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("Not authorized to modify {0}")]
    NoAuth(String),

    #[error("Connection to coordination store lost")]
    ConnectionLoss,

    #[error("Coordination store session expired")]
    SessionExpired,

    // Payload errors
    #[error("Payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    ///
    /// Retryable errors heal through the session/reconnect cycle: the
    /// next CONNECTED transition or watch-driven refresh repeats the work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionLoss | Error::SessionExpired)
    }

    /// Check if this error means the target node is already gone
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::NoNode(_))
    }
}
