//! Error types for the voice session core

use thiserror::Error;

/// Result type alias for voice session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur in the duplex voice session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Microphone or speaker unavailable, or permission denied.
    #[error("Audio device error: {0}")]
    Device(String),

    /// The engine channel failed to open or dropped unexpectedly.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A received chunk could not be decoded to playable audio.
    #[error("Decode error: {0}")]
    Decode(String),

    /// API misuse, e.g. connect while a session is already live.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for SessionError {
    fn from(err: cpal::DevicesError) -> Self {
        SessionError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for SessionError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        SessionError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for SessionError {
    fn from(err: cpal::BuildStreamError) -> Self {
        SessionError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for SessionError {
    fn from(err: cpal::PlayStreamError) -> Self {
        SessionError::Device(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Connection(err.to_string())
    }
}
