//! Error types for the duplex voice gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition service error
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Write to a recognition stream that has been torn down
    #[error("recognition stream closed")]
    RecognitionClosed,

    /// Text generation service error
    #[error("generation error: {0}")]
    Generation(String),

    /// Speech synthesis service error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Malformed or out-of-place client message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session or its connection is gone
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Base64 decoding error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Whether the session can continue after this error
    ///
    /// External-service failures and protocol violations are recovered
    /// locally; only configuration problems and a closed session are not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::SessionClosed)
    }
}
