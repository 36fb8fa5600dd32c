/*
    errors.rs - Errors raised by mutation hooks
*/

use crate::core_access::AccessError;
use crate::core_pubsub::PubSubError;
use crate::core_store::StoreError;
use thiserror::Error;

/// Errors a hook can raise to stop a mutation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HookError {
    /// Hook refused the mutation
    #[error("Mutation vetoed by hook {hook}: {reason}")]
    Vetoed { hook: String, reason: String },

    /// Authorization failed inside the allow/deny hook
    #[error(transparent)]
    Access(#[from] AccessError),

    /// Loading the pre-image failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publishing the change on the broadcast transport failed
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

/// Result type for hook callbacks
pub type HookResult<T> = Result<T, HookError>;
