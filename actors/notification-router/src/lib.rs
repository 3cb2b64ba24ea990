//! Notification Router (routing and delivery optimization core)
//!
//! Takes a `NotificationRequest` plus the user's channel preferences and:
//! - picks a channel from the type-specific priority table
//! - holds non-urgent notifications during the user's quiet hours
//! - charges a fixed-window rate limit per (user, channel, type)
//! - plans retries, A/B variants, send times and batches
//!
//! Storage, clock and event publishing are injected through the traits in
//! [`runtime`]; the host wires in Redis and NATS adapters.

pub mod channel_selector;
pub mod optimizer;
pub mod quiet_hours;
pub mod rate_limit;
pub mod retry;
pub mod routing;
pub mod runtime;
pub mod variant;

pub use channel_selector::{ChannelSelection, ChannelSelector};
pub use optimizer::{ChannelScore, ChannelSelectionOutcome, DeliveryOptimizer};
pub use quiet_hours::QuietHoursGate;
pub use rate_limit::{advance_counter, CounterCheck, RateLimitTable, RateLimiter};
pub use retry::RetryPlanner;
pub use routing::{RoutingEngine, RoutingState};
pub use runtime::{
    AssignmentStore, ChannelStatsStore, Clock, CounterStore, EventSink, FixedClock, InMemoryAssignmentStore,
    InMemoryCounterStore, InMemoryPreferenceStore, InMemoryStatsStore, NoopEventSink, PreferenceStore,
    RateLimitKey, RecordingEventSink, SystemClock,
};
pub use variant::{two_proportion_test, ConversionSample, SignificanceResult, VariantAssigner};
