/*
    errors.rs - Errors raised while starting or running observers
*/

use crate::core_observe::event::DriverKind;
use crate::core_pubsub::PubSubError;
use crate::core_store::StoreError;
use thiserror::Error;

/// Errors reported to callers of `observe_changes` / `observe` / `publish`
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ObserveError {
    /// The requested driver cannot serve this query here
    #[error("Driver {driver} unavailable: {reason}")]
    DriverUnavailable { driver: DriverKind, reason: String },

    /// Events cannot be keyed without `_id`
    #[error("You may not observe a cursor with {{fields: {{_id: 0}}}}")]
    IdExcluded,

    /// Callbacks or options do not fit together
    #[error("Invalid observe options: {0}")]
    InvalidOptions(String),

    /// Initial query or driver setup failed
    #[error("Driver failed to start: {0}")]
    DriverStart(String),

    /// Store collaborator error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Broadcast transport error
    #[error(transparent)]
    PubSub(#[from] PubSubError),

    /// The multiplexer was torn down while attaching
    #[error("Observer stopped")]
    Stopped,

    /// Writes can no longer join this fence
    #[error("Change fence has already fired")]
    FenceFired,
}

/// Result type for observation operations
pub type ObserveResult<T> = Result<T, ObserveError>;
