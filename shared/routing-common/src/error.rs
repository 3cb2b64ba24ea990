//! Error taxonomy shared by the engine and its adapters
//!
//! A blocked routing decision is not an error and never shows up here.

use crate::validation::ValidationError;
use thiserror::Error;

/// Errors surfaced by routing and optimization calls
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RoutingError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RoutingError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        RoutingError::Store(message.into())
    }

    /// Only collaborator failures are worth retrying; bad input stays bad
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoutingError::Store(_))
    }

    /// Short machine-readable code for logs and event payloads
    pub fn code(&self) -> &'static str {
        match self {
            RoutingError::Validation(_) => "validation_error",
            RoutingError::NotFound { .. } => "not_found",
            RoutingError::Store(_) => "store_error",
            RoutingError::Serialization(_) => "serialization_error",
        }
    }
}

/// Result type used throughout the routing crates
pub type RoutingResult<T> = Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable_classification() {
        assert!(RoutingError::store("redis down").is_retryable());
        assert!(!RoutingError::not_found("preferences", "u1").is_retryable());
        assert!(!RoutingError::from(ValidationError::InvalidTimezone("x".into())).is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = RoutingError::not_found("preferences", "user-42");
        assert_eq!(err.to_string(), "preferences not found: user-42");
        assert_eq!(err.code(), "not_found");
    }
}
