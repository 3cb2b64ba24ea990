//! Core types for the routing engine
//!
//! Requests and preference snapshots come in from the host service; routing
//! decisions, retry plans, delivery attempts and optimization results go back
//! out. Nothing in here is mutated by the engine once it has been handed over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::validation::ValidationError;

/// Delivery channels known to the router.
///
/// Declaration order doubles as the tie-break order when two channels score
/// the same, so new variants go at the end together with a priority entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
    Webhook,
}

impl ChannelKind {
    /// All channels in declaration order
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::Push,
        ChannelKind::Webhook,
    ];

    /// Get channel name as lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
            ChannelKind::Webhook => "webhook",
        }
    }

    /// Get NATS subject for handing an allowed notification to the transport
    pub fn nats_subject(&self) -> String {
        crate::subjects::send_immediate(self.as_str())
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "Email"),
            ChannelKind::Sms => write!(f, "SMS"),
            ChannelKind::Push => write!(f, "Push"),
            ChannelKind::Webhook => write!(f, "Webhook"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            "push" => Ok(ChannelKind::Push),
            "webhook" => Ok(ChannelKind::Webhook),
            other => Err(ValidationError::InvalidChannel(other.to_string())),
        }
    }
}

/// Notification categories; they drive channel priorities, rate limits and
/// whether quiet hours apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Urgent,
    Transactional,
    Marketing,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Urgent => "urgent",
            NotificationType::Transactional => "transactional",
            NotificationType::Marketing => "marketing",
        }
    }

    /// Urgent notifications ignore quiet hours
    pub fn bypasses_quiet_hours(&self) -> bool {
        matches!(self, NotificationType::Urgent)
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification waiting for a routing decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_channel: Option<ChannelKind>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NotificationRequest {
    pub fn new(user_id: impl Into<String>, notification_type: NotificationType) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            notification_type,
            requested_channel: None,
            priority: 0,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_requested_channel(mut self, channel: ChannelKind) -> Self {
        self.requested_channel = Some(channel);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Do-not-disturb window in the user's local clock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    pub start: String, // HH:MM format
    pub end: String,   // HH:MM format
}

impl QuietHours {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Start of the window as minute-of-day
    pub fn start_minute(&self) -> Result<u16, ValidationError> {
        crate::validation::parse_clock_time(&self.start)
    }

    /// End of the window as minute-of-day
    pub fn end_minute(&self) -> Result<u16, ValidationError> {
        crate::validation::parse_clock_time(&self.end)
    }
}

/// Snapshot of a user's channel preferences from the preference store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserChannelPreferences {
    pub user_id: String,
    pub enabled_channels: BTreeSet<ChannelKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl UserChannelPreferences {
    pub fn new(user_id: impl Into<String>, channels: impl IntoIterator<Item = ChannelKind>) -> Self {
        Self {
            user_id: user_id.into(),
            enabled_channels: channels.into_iter().collect(),
            quiet_hours: None,
            timezone: default_timezone(),
        }
    }

    pub fn with_quiet_hours(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.quiet_hours = Some(QuietHours::new(start, end));
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn is_enabled(&self, channel: ChannelKind) -> bool {
        self.enabled_channels.contains(&channel)
    }
}

/// Why a notification was not allowed through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BlockReason {
    #[serde(rename = "no suitable channel")]
    NoSuitableChannel,
    #[serde(rename = "quiet hours")]
    QuietHours,
    #[serde(rename = "rate limit exceeded")]
    RateLimitExceeded,
}

impl BlockReason {
    /// Machine-readable reason string
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::NoSuitableChannel => "no suitable channel",
            BlockReason::QuietHours => "quiet hours",
            BlockReason::RateLimitExceeded => "rate limit exceeded",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate outcomes recorded on a decision, in evaluation order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    ChannelSelected {
        channel: ChannelKind,
        explicit: bool,
    },
    NoChannel,
    QuietHoursBypassed,
    QuietHoursPassed,
    QuietHoursBlocked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quiet_until: Option<DateTime<Utc>>,
    },
    RateLimitPassed {
        remaining: u32,
    },
    RateLimitBlocked {
        limit: u32,
    },
}

/// Outcome of routing one notification at one instant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub notification_id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelKind>,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
    pub applied_rules: Vec<Rule>,
    pub evaluated_at: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn allowed(
        request: &NotificationRequest,
        channel: ChannelKind,
        applied_rules: Vec<Rule>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: request.id,
            user_id: request.user_id.clone(),
            channel: Some(channel),
            allowed: true,
            reason: None,
            applied_rules,
            evaluated_at,
        }
    }

    pub fn blocked(
        request: &NotificationRequest,
        channel: Option<ChannelKind>,
        reason: BlockReason,
        applied_rules: Vec<Rule>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: request.id,
            user_id: request.user_id.clone(),
            channel,
            allowed: false,
            reason: Some(reason),
            applied_rules,
            evaluated_at,
        }
    }

    /// Reason string for display or logging, `None` when allowed
    pub fn reason_str(&self) -> Option<&'static str> {
        self.reason.map(|r| r.as_str())
    }
}

/// Fixed-window counter for one (user, channel, type) key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
}

/// Result of a rate-limit check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: u32,
}

/// Lifecycle state of an A/B test
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Active,
    Paused,
    Completed,
    Deleted,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Active => "active",
            TestStatus::Paused => "paused",
            TestStatus::Completed => "completed",
            TestStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One arm of an A/B test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    pub name: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

/// Share of traffic sent to a variant, in percent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficAllocation {
    pub variant: String,
    pub percentage: f64,
}

/// A/B test definition. `traffic_split` is walked in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ABTest {
    pub id: String,
    pub variants: Vec<Variant>,
    pub traffic_split: Vec<TrafficAllocation>,
    pub status: TestStatus,
}

impl ABTest {
    /// Look up a variant by name
    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Memoized variant for one (test, user) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAssignment {
    pub test_id: String,
    pub user_id: String,
    pub variant: String,
}

/// How retry delays grow between attempts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(ValidationError::InvalidParameter {
                field: "strategy".to_string(),
                reason: format!("unknown backoff strategy '{}'", other),
            }),
        }
    }
}

/// Retry schedule computed once per optimization request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPlan {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    #[serde(rename = "base_delay_secs", with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(rename = "delays_secs", with = "duration_secs_vec")]
    pub delays: Vec<Duration>,
}

/// Historical delivery performance for one channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChannelStats {
    /// Fraction of successful deliveries, 0.0..=1.0
    pub success_rate: f64,
    pub avg_delivery_time_secs: f64,
    /// Cost per message
    pub cost: f64,
}

/// Optimizations the delivery optimizer knows how to run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    Timing,
    ChannelSelection,
    Personalization,
    BatchProcessing,
    RetryStrategy,
}

impl OptimizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationKind::Timing => "timing",
            OptimizationKind::ChannelSelection => "channel_selection",
            OptimizationKind::Personalization => "personalization",
            OptimizationKind::BatchProcessing => "batch_processing",
            OptimizationKind::RetryStrategy => "retry_strategy",
        }
    }
}

impl FromStr for OptimizationKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timing" => Ok(OptimizationKind::Timing),
            "channel_selection" => Ok(OptimizationKind::ChannelSelection),
            "personalization" => Ok(OptimizationKind::Personalization),
            "batch_processing" => Ok(OptimizationKind::BatchProcessing),
            "retry_strategy" => Ok(OptimizationKind::RetryStrategy),
            _ => Err(ValidationError::UnknownOptimizationType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStatus {
    Pending,
    Completed,
    Failed,
}

/// Outcome of one optimization. Failures are captured here, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationResult {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub kind: String,
    pub status: OptimizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OptimizationResult {
    pub fn pending(notification_id: Uuid, kind: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            kind: kind.into(),
            status: OptimizationStatus::Pending,
            result: None,
            error: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn complete(&mut self, result: serde_json::Value, at: DateTime<Utc>) {
        self.status = OptimizationStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = OptimizationStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
        self.completed_at = Some(at);
    }

    pub fn is_failed(&self) -> bool {
        self.status == OptimizationStatus::Failed
    }
}

/// Descriptor handed to the transport collaborator for an allowed notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryAttempt {
    pub notification_id: Uuid,
    pub user_id: String,
    pub channel: ChannelKind,
    pub send_at: DateTime<Utc>,
    pub retry_plan: RetryPlan,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Routing outcome plus the attempt to hand to transport when allowed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryPlan {
    pub decision: RoutingDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<DeliveryAttempt>,
}

/// Wire form of an optimization request. `kind` stays a raw string so that an
/// unknown kind becomes a failed result instead of a decode error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationRequest {
    pub notification: NotificationRequest,
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Events announced to the observability sink after a decision is computed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RoutingEvent {
    Decision(RoutingDecision),
    Optimization(OptimizationResult),
}

impl RoutingEvent {
    /// Subject the event is published on
    pub fn subject(&self) -> String {
        match self {
            RoutingEvent::Decision(decision) => crate::subjects::route_decision(&decision.user_id),
            RoutingEvent::Optimization(result) => {
                crate::subjects::optimize_result(&result.notification_id.to_string())
            }
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_secs_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|d| d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let secs = Vec::<u64>::deserialize(deserializer)?;
        Ok(secs.into_iter().map(Duration::from_secs).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_order_matches_declaration() {
        let mut channels = vec![ChannelKind::Webhook, ChannelKind::Push, ChannelKind::Email, ChannelKind::Sms];
        channels.sort();
        assert_eq!(channels, ChannelKind::ALL.to_vec());
    }

    #[test]
    fn test_channel_parses_case_insensitively() {
        assert_eq!("SMS".parse::<ChannelKind>().unwrap(), ChannelKind::Sms);
        assert_eq!(" push ".parse::<ChannelKind>().unwrap(), ChannelKind::Push);
        assert!("pager".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_block_reason_serializes_to_machine_string() {
        let json = serde_json::to_string(&BlockReason::QuietHours).unwrap();
        assert_eq!(json, "\"quiet hours\"");
        let back: BlockReason = serde_json::from_str("\"rate limit exceeded\"").unwrap();
        assert_eq!(back, BlockReason::RateLimitExceeded);
    }

    #[test]
    fn test_request_uses_type_field_on_the_wire() {
        let raw = serde_json::json!({
            "id": "6f1c2b9e-3d4a-4c55-8f77-1a2b3c4d5e6f",
            "user_id": "u1",
            "type": "marketing",
            "requested_channel": "email"
        });
        let request: NotificationRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.notification_type, NotificationType::Marketing);
        assert_eq!(request.requested_channel, Some(ChannelKind::Email));
        assert_eq!(request.priority, 0);
    }

    #[test]
    fn test_retry_plan_serializes_delays_in_seconds() {
        let plan = RetryPlan {
            max_retries: 2,
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(30),
            delays: vec![Duration::from_secs(30), Duration::from_secs(60)],
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["delays_secs"], serde_json::json!([30, 60]));
        assert_eq!(json["strategy"], "linear");
        let back: RetryPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_optimization_result_transitions() {
        let now = Utc::now();
        let mut result = OptimizationResult::pending(Uuid::new_v4(), "timing", now);
        assert_eq!(result.status, OptimizationStatus::Pending);

        result.fail("boom", now);
        assert!(result.is_failed());
        assert_eq!(result.error.as_deref(), Some("boom"));

        result.complete(serde_json::json!({"ok": true}), now);
        assert_eq!(result.status, OptimizationStatus::Completed);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_unknown_optimization_kind_is_rejected() {
        assert_eq!(
            "retry_strategy".parse::<OptimizationKind>().unwrap(),
            OptimizationKind::RetryStrategy
        );
        let err = "teleport".parse::<OptimizationKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown optimization type: teleport");
    }
}
