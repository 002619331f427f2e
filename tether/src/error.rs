//! Error types for duplex channel operations.

use thiserror::Error;

/// Errors surfaced by duplex channel operations.
///
/// The `Already*`/`Not*` variants report programmer misuse and are returned
/// synchronously to the caller. [`ChannelError::Transport`] exists for raw
/// channel implementations; the buffered layer catches and retries it
/// internally and never re-surfaces it to the application.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The output channel is already open.
    #[error("connection is already open")]
    AlreadyConnected,

    /// The output channel is not open.
    #[error("connection is not open")]
    NotConnected,

    /// The input channel is already listening.
    #[error("channel is already listening")]
    AlreadyListening,

    /// The input channel is not listening.
    #[error("channel is not listening")]
    NotListening,

    /// A raw transport operation failed.
    ///
    /// Recoverable by retry; the buffered layer absorbs these up to its
    /// configured `max_offline_time`.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(error: std::io::Error) -> Self {
        ChannelError::Transport(error.to_string())
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
