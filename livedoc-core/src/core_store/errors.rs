/*
    errors.rs - Error types for the store collaborator

    Defines the errors that can occur in:
    - Document writes (duplicate ids, bad mutators)
    - Lookups
    - Lock handling inside in-memory stores
*/

use crate::core_doc::{DocError, DocId};
use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A document with this id already exists
    #[error("Duplicate id {id} in collection {collection}")]
    DuplicateId { collection: String, id: String },

    /// Selector, mutator or document could not be interpreted
    #[error(transparent)]
    Document(#[from] DocError),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A bulk write stopped part way; `applied` documents were written
    #[error("Bulk write stopped after {} documents: {source}", .applied.len())]
    Partial {
        applied: Vec<DocId>,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Wrap the error that stopped a bulk write. Nothing applied means
    /// nothing changed, so the original error is returned as is.
    pub fn partial(applied: Vec<DocId>, source: StoreError) -> Self {
        if applied.is_empty() {
            return source;
        }
        StoreError::Partial {
            applied,
            source: Box::new(source),
        }
    }

    /// Documents a failed write still changed
    pub fn applied(&self) -> &[DocId] {
        match self {
            StoreError::Partial { applied, .. } => applied,
            _ => &[],
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::DuplicateId {
            collection: "items".to_string(),
            id: "a".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate id a in collection items");

        let err: StoreError = DocError::InvalidMutator("bad".to_string()).into();
        assert_eq!(err.to_string(), "Invalid mutator: bad");
    }

    #[test]
    fn test_partial_keeps_applied_ids() {
        let dup = StoreError::DuplicateId {
            collection: "items".to_string(),
            id: "b".to_string(),
        };
        assert_eq!(StoreError::partial(Vec::new(), dup.clone()), dup);

        let err = StoreError::partial(vec![DocId::from("a")], dup);
        assert_eq!(err.applied(), &[DocId::from("a")]);
        assert!(err.to_string().starts_with("Bulk write stopped after 1 documents"));
    }
}
