//! Error types for the realtime session manager.

use thiserror::Error;

/// Result type alias for session-manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a realtime session.
#[derive(Debug, Error)]
pub enum Error {
    /// Audio device error
    #[error("audio device error: {0}")]
    Audio(String),

    /// The audio device was force-closed while an operation was pending
    #[error("audio device closed")]
    AudioClosed,

    /// WebSocket transport error
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// A connection header could not be constructed
    #[error("invalid connection header: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    /// Event (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shared state was poisoned by a panicking thread
    #[error("internal state poisoned: {0}")]
    Poisoned(String),
}
