/*
    errors.rs - Broadcast transport errors
*/

use thiserror::Error;

/// Errors from the broadcast collaborator
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PubSubError {
    /// Channel cannot be listened on or emitted to
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Transport is shut down
    #[error("Broadcast transport closed")]
    Closed,

    /// Event could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for broadcast operations
pub type PubSubResult<T> = Result<T, PubSubError>;
