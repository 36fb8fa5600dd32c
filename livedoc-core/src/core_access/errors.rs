/*
    errors.rs - Authorization errors

    AccessDenied and Unsupported both map to a 403 status; Unsupported keeps
    a distinct message so a rejected upsert or replacement is easy to tell
    apart from a validator saying no. Configuration errors are programmer
    mistakes and are never retried.
*/

use thiserror::Error;

/// Errors raised while registering or evaluating allow/deny rules
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// A deny rule matched or no allow rule did
    #[error("Access denied{}", reason_suffix(.reason))]
    AccessDenied { reason: String },

    /// The mutation's shape cannot be checked per document
    #[error("{reason}")]
    Unsupported { reason: String },

    /// Rules registered on a collection without mutation methods, or similar
    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {}", reason)
    }
}

impl AccessError {
    /// Plain denial with no extra detail
    pub fn denied() -> Self {
        AccessError::AccessDenied { reason: String::new() }
    }

    pub fn denied_because(reason: impl Into<String>) -> Self {
        AccessError::AccessDenied { reason: reason.into() }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        AccessError::Unsupported { reason: reason.into() }
    }

    /// HTTP-equivalent status code
    pub fn status(&self) -> u16 {
        match self {
            AccessError::AccessDenied { .. } | AccessError::Unsupported { .. } => 403,
            AccessError::Configuration(_) => 500,
        }
    }

    /// True for every flavour of "forbidden"
    pub fn is_access_denied(&self) -> bool {
        matches!(self, AccessError::AccessDenied { .. } | AccessError::Unsupported { .. })
    }
}

/// Result type for access-control operations
pub type AccessResult<T> = Result<T, AccessError>;
