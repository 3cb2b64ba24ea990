//! Provider error types

use routing_common::RoutingError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl ProviderError {
    pub fn config(message: impl Into<String>) -> Self {
        ProviderError::Config(message.into())
    }

    pub fn nats(error: impl std::fmt::Display) -> Self {
        ProviderError::Nats(error.to_string())
    }
}

/// Whether an error is worth another attempt
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            ProviderError::Nats(_) | ProviderError::Timeout(_) => true,
            ProviderError::Routing(e) => e.is_retryable(),
            ProviderError::Config(_) | ProviderError::Serialization(_) => false,
        }
    }
}

/// Adapter failures reach the engine as store errors
impl From<ProviderError> for RoutingError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Routing(e) => e,
            ProviderError::Serialization(e) => RoutingError::Serialization(e),
            other => RoutingError::store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable_store_error() {
        let err = ProviderError::Timeout(Duration::from_millis(250));
        assert!(err.is_retryable());

        let routed: RoutingError = err.into();
        assert!(routed.is_retryable());
        assert_eq!(routed.code(), "store_error");
    }

    #[test]
    fn test_config_errors_are_final() {
        assert!(!ProviderError::config("redis_url is required").is_retryable());
    }

    #[test]
    fn test_routing_error_passes_through() {
        let inner = RoutingError::not_found("preferences", "u1");
        let routed: RoutingError = ProviderError::from(inner).into();
        assert!(matches!(routed, RoutingError::NotFound { .. }));
    }
}
