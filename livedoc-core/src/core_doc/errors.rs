/*
    errors.rs - Errors raised while interpreting documents and queries
*/

use thiserror::Error;

/// Malformed selectors, projections, sorts and mutators
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DocError {
    /// Selector could not be interpreted
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// Projection mixes inclusion and exclusion or has bad values
    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    /// Sort specification could not be parsed
    #[error("Invalid sort: {0}")]
    InvalidSort(String),

    /// Mutator is malformed or cannot be applied to the document
    #[error("Invalid mutator: {0}")]
    InvalidMutator(String),

    /// Document is not an object or lacks a usable `_id`
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Unknown id generation strategy
    #[error("Unknown id generation: {0}")]
    UnknownIdGeneration(String),
}

/// Result type for document operations
pub type DocResult<T> = Result<T, DocError>;
