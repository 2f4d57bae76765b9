//! Error types for webrelay

/// Main error type for relay client operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Wrong password or a tampered record. Never carries cipher details.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered a correlated request with `success = false`.
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Session stopped")]
    Stopped,

    #[error("Push error: {0}")]
    Push(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Handshake(_) | Self::Push(_)
        )
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("JSON error: {}", err))
    }
}

impl From<rmpv::encode::Error> for RelayError {
    fn from(err: rmpv::encode::Error) -> Self {
        Self::Protocol(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmpv::decode::Error> for RelayError {
    fn from(err: rmpv::decode::Error) -> Self {
        Self::Protocol(format!("MessagePack decode error: {}", err))
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Protocol(format!("Payload encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Protocol(format!("Payload decode error: {}", err))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Push(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background task failed: {}", err))
    }
}

/// Result type alias for relay client operations
pub type Result<T> = std::result::Result<T, RelayError>;
