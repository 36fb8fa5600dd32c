/*
    errors.rs - Errors surfaced by collections and the method boundary

    Hook errors are flattened on the way in so a denial raised inside the
    allow/deny hook reaches the caller as `CollectionError::Access`.
*/

use crate::core_access::AccessError;
use crate::core_doc::DocError;
use crate::core_hooks::HookError;
use crate::core_observe::ObserveError;
use crate::core_pubsub::PubSubError;
use crate::core_store::StoreError;
use thiserror::Error;

/// Errors raised by collection operations and method calls
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollectionError {
    /// Authorization failed or rules were misconfigured
    #[error(transparent)]
    Access(#[from] AccessError),

    /// A before-hook refused the mutation
    #[error("Mutation vetoed by hook {hook}: {reason}")]
    Vetoed { hook: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Observe(#[from] ObserveError),

    #[error(transparent)]
    PubSub(#[from] PubSubError),

    #[error(transparent)]
    Document(#[from] DocError),

    /// Method arguments could not be decoded
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// No method registered under this name
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Duplicate method or collection, missing mutation methods
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<HookError> for CollectionError {
    fn from(err: HookError) -> Self {
        match err {
            HookError::Vetoed { hook, reason } => CollectionError::Vetoed { hook, reason },
            HookError::Access(e) => CollectionError::Access(e),
            HookError::Store(e) => CollectionError::Store(e),
            HookError::PubSub(e) => CollectionError::PubSub(e),
        }
    }
}

impl CollectionError {
    /// True for every flavour of "forbidden"
    pub fn is_access_denied(&self) -> bool {
        matches!(self, CollectionError::Access(e) if e.is_access_denied())
    }

    /// True for programmer mistakes, wherever they were detected
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CollectionError::Configuration(_) | CollectionError::Access(AccessError::Configuration(_))
        )
    }
}

/// Result type for collection operations
pub type CollectionResult<T> = Result<T, CollectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_denial_flattens_to_access() {
        let err: CollectionError = HookError::Access(AccessError::denied()).into();
        assert!(err.is_access_denied());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_from_either_layer() {
        assert!(CollectionError::Configuration("twice".to_string()).is_configuration());
        assert!(CollectionError::Access(AccessError::Configuration("no methods".to_string())).is_configuration());
    }
}
