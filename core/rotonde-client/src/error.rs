//! Error types for the client engine.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A packet was sent without a connected transport.
    #[error("not connected")]
    NotConnected,

    /// The channel could not be opened or failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A packet could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] rotonde_types::Error),

    /// One or more awaited identifiers never arrived.
    #[error("timed out waiting for {}", .identifiers.join(", "))]
    Timeout { identifiers: Vec<String> },

    /// The connection driver is gone. Waits from
    /// [`HandlerManager::make_promise`](crate::HandlerManager::make_promise)
    /// never report it: their own handler keeps the reply sender alive.
    #[error("channel closed")]
    ChannelClosed,
}

impl ClientError {
    /// Returns the identifiers of a timeout, or an empty slice.
    pub fn timed_out_identifiers(&self) -> &[String] {
        match self {
            ClientError::Timeout { identifiers } => identifiers,
            _ => &[],
        }
    }
}
