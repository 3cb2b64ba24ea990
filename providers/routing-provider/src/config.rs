//! Configuration for the Routing Provider

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ProviderError;

/// Configuration for the Routing Provider
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProviderConfig {
    /// Redis connection URL (preferences, stats, counters, assignments)
    pub redis_url: String,

    /// NATS connection URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Timeout applied to every store call, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Attempts when connecting to Redis and NATS at startup
    #[serde(default = "default_connect_retry_attempts")]
    pub connect_retry_attempts: u32,

    /// First backoff delay between connection attempts, in milliseconds
    #[serde(default = "default_connect_initial_delay")]
    pub connect_initial_delay_ms: u64,

    /// Requests handled concurrently before new ones wait
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl ProviderConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// Load configuration from wasmCloud properties HashMap
    ///
    /// Used when running under a wasmCloud host, where the WADM manifest
    /// passes configuration through `HostData.config`.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ProviderError> {
        let redis_url = props
            .get("redis_url")
            .cloned()
            .ok_or_else(|| ProviderError::config("redis_url is required"))?;

        let nats_url = props
            .get("nats_url")
            .cloned()
            .unwrap_or_else(default_nats_url);

        Ok(Self {
            redis_url,
            nats_url,
            store_timeout_ms: parse_prop(props, "store_timeout_ms", default_store_timeout)?,
            connect_retry_attempts: parse_prop(props, "connect_retry_attempts", default_connect_retry_attempts)?,
            connect_initial_delay_ms: parse_prop(props, "connect_initial_delay_ms", default_connect_initial_delay)?,
            max_concurrent_requests: parse_prop(props, "max_concurrent_requests", default_max_concurrent_requests)?,
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.store_timeout_ms == 0 {
            return Err(ProviderError::config("store_timeout_ms must be greater than 0"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ProviderError::config("max_concurrent_requests must be greater than 0"));
        }
        Ok(())
    }
}

fn parse_prop<T: FromStr>(
    props: &HashMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> Result<T, ProviderError> {
    match props.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ProviderError::config(format!("invalid value for {}: '{}'", key, raw))),
        None => Ok(default()),
    }
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_store_timeout() -> u64 {
    2000
}

fn default_connect_retry_attempts() -> u32 {
    5
}

fn default_connect_initial_delay() -> u64 {
    200
}

fn default_max_concurrent_requests() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_properties_defaults() {
        let props = HashMap::from([("redis_url".to_string(), "redis://cache:6379".to_string())]);
        let config = ProviderConfig::from_properties(&props).unwrap();

        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert_eq!(config.connect_retry_attempts, 5);
        assert_eq!(config.max_concurrent_requests, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_properties_requires_redis_url() {
        let err = ProviderConfig::from_properties(&HashMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: redis_url is required");
    }

    #[test]
    fn test_from_properties_rejects_bad_numbers() {
        let props = HashMap::from([
            ("redis_url".to_string(), "redis://cache:6379".to_string()),
            ("store_timeout_ms".to_string(), "soon".to_string()),
        ]);
        assert!(ProviderConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_overrides_and_validation() {
        let props = HashMap::from([
            ("redis_url".to_string(), "redis://cache:6379".to_string()),
            ("nats_url".to_string(), "nats://bus:4222".to_string()),
            ("max_concurrent_requests".to_string(), "0".to_string()),
        ]);
        let config = ProviderConfig::from_properties(&props).unwrap();
        assert_eq!(config.nats_url, "nats://bus:4222");
        assert!(config.validate().is_err());
    }
}
