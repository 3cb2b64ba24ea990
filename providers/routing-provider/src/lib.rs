//! # Routing wasmCloud Provider
//!
//! Hosts the notification router next to Redis and NATS:
//! - Redis-backed preference, stats, counter and assignment stores
//! - NATS request handling for `notifications.route.request` and
//!   `notifications.optimize.request`
//! - decision and optimization events published back onto NATS

pub mod config;
pub mod error;
pub mod handler;
pub mod nats_sink;
pub mod provider;
pub mod redis_store;
pub mod retry;

pub use config::ProviderConfig;
pub use error::{IsRetryable, ProviderError};
pub use handler::{Dispatch, HandlerOutcome, RequestHandler};
pub use nats_sink::NatsEventSink;
pub use provider::RoutingProvider;
pub use redis_store::RedisRoutingStore;
pub use retry::{retry_with_backoff, RetryConfig};
