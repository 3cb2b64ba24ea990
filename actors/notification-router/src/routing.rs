//! Routing engine
//!
//! Runs the gates in a fixed order: channel selection, then quiet hours, then
//! the rate limiter. The limiter is the only gate with a side effect, so it is
//! reached only once the first two have passed.

use chrono::{DateTime, Utc};
use routing_common::{
    BlockReason, ChannelKind, NotificationRequest, RoutingDecision, RoutingError, RoutingEvent,
    RoutingResult, Rule, UserChannelPreferences, Validate,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::channel_selector::ChannelSelector;
use crate::quiet_hours::QuietHoursGate;
use crate::rate_limit::RateLimiter;
use crate::runtime::{Clock, CounterStore, EventSink, PreferenceStore};

/// Where a request is in the gate sequence
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingState {
    Requested,
    ChannelChosen(ChannelKind),
    QuietHoursChecked(ChannelKind),
    RateLimitChecked(ChannelKind),
    Allowed(RoutingDecision),
    Blocked(RoutingDecision),
}

impl RoutingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoutingState::Allowed(_) | RoutingState::Blocked(_))
    }

    fn name(&self) -> &'static str {
        match self {
            RoutingState::Requested => "requested",
            RoutingState::ChannelChosen(_) => "channel_chosen",
            RoutingState::QuietHoursChecked(_) => "quiet_hours_checked",
            RoutingState::RateLimitChecked(_) => "rate_limit_checked",
            RoutingState::Allowed(_) => "allowed",
            RoutingState::Blocked(_) => "blocked",
        }
    }
}

pub struct RoutingEngine {
    preferences: Arc<dyn PreferenceStore>,
    rate_limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    selector: ChannelSelector,
    gate: QuietHoursGate,
}

impl RoutingEngine {
    pub fn new(
        preferences: Arc<dyn PreferenceStore>,
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            preferences,
            rate_limiter: RateLimiter::new(counters),
            clock,
            events,
            selector: ChannelSelector::new(),
            gate: QuietHoursGate::new(),
        }
    }

    /// Replace the limiter, e.g. to override the limit table or window
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    /// Preferences for the user; a missing snapshot is `NotFound`
    pub async fn load_preferences(&self, user_id: &str) -> RoutingResult<UserChannelPreferences> {
        self.preferences
            .get_preferences(user_id)
            .await?
            .ok_or_else(|| RoutingError::not_found("preferences", user_id))
    }

    /// Route a request at the clock's current time and announce the decision
    pub async fn route(&self, request: &NotificationRequest) -> RoutingResult<RoutingDecision> {
        request.validate()?;
        let preferences = self.load_preferences(&request.user_id).await?;
        let now = self.clock.now();

        let decision = self.evaluate(request, &preferences, now).await?;

        info!(
            "Routed notification {} for {}: allowed={} channel={:?} reason={:?}",
            request.id,
            request.user_id,
            decision.allowed,
            decision.channel,
            decision.reason_str()
        );
        self.events.publish(RoutingEvent::Decision(decision.clone()));

        Ok(decision)
    }

    /// Run the gates against an explicit preference snapshot and instant
    pub async fn evaluate(
        &self,
        request: &NotificationRequest,
        preferences: &UserChannelPreferences,
        now: DateTime<Utc>,
    ) -> RoutingResult<RoutingDecision> {
        let mut rules = Vec::new();
        let mut state = RoutingState::Requested;

        loop {
            state = match state {
                RoutingState::Requested => match self.selector.select(
                    request.requested_channel,
                    request.notification_type,
                    &preferences.enabled_channels,
                ) {
                    Some(selection) => {
                        rules.push(Rule::ChannelSelected {
                            channel: selection.channel,
                            explicit: selection.explicit,
                        });
                        RoutingState::ChannelChosen(selection.channel)
                    }
                    None => {
                        rules.push(Rule::NoChannel);
                        RoutingState::Blocked(RoutingDecision::blocked(
                            request,
                            None,
                            BlockReason::NoSuitableChannel,
                            std::mem::take(&mut rules),
                            now,
                        ))
                    }
                },
                RoutingState::ChannelChosen(channel) => {
                    if request.notification_type.bypasses_quiet_hours() {
                        rules.push(Rule::QuietHoursBypassed);
                        RoutingState::QuietHoursChecked(channel)
                    } else if self.gate.is_quiet(
                        preferences.quiet_hours.as_ref(),
                        &preferences.timezone,
                        now,
                    )? {
                        let quiet_until = self.gate.quiet_until(
                            preferences.quiet_hours.as_ref(),
                            &preferences.timezone,
                            now,
                        )?;
                        rules.push(Rule::QuietHoursBlocked { quiet_until });
                        RoutingState::Blocked(RoutingDecision::blocked(
                            request,
                            Some(channel),
                            BlockReason::QuietHours,
                            std::mem::take(&mut rules),
                            now,
                        ))
                    } else {
                        rules.push(Rule::QuietHoursPassed);
                        RoutingState::QuietHoursChecked(channel)
                    }
                }
                RoutingState::QuietHoursChecked(channel) => {
                    let outcome = self
                        .rate_limiter
                        .check_and_increment(&request.user_id, channel, request.notification_type, now)
                        .await?;
                    if outcome.allowed {
                        rules.push(Rule::RateLimitPassed {
                            remaining: outcome.remaining,
                        });
                        RoutingState::RateLimitChecked(channel)
                    } else {
                        rules.push(Rule::RateLimitBlocked {
                            limit: self
                                .rate_limiter
                                .table()
                                .limit_for(channel, request.notification_type),
                        });
                        RoutingState::Blocked(RoutingDecision::blocked(
                            request,
                            Some(channel),
                            BlockReason::RateLimitExceeded,
                            std::mem::take(&mut rules),
                            now,
                        ))
                    }
                }
                RoutingState::RateLimitChecked(channel) => RoutingState::Allowed(RoutingDecision::allowed(
                    request,
                    channel,
                    std::mem::take(&mut rules),
                    now,
                )),
                RoutingState::Allowed(decision) | RoutingState::Blocked(decision) => return Ok(decision),
            };

            debug!("Notification {} -> {}", request.id, state.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FixedClock, InMemoryCounterStore, InMemoryPreferenceStore, RecordingEventSink};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use routing_common::test_utilities::{
        create_all_channel_preferences, create_test_preferences, create_test_request, utc_at, TEST_USER_ID,
    };
    use routing_common::{NotificationType, QuietHours};

    struct Harness {
        engine: RoutingEngine,
        prefs: Arc<InMemoryPreferenceStore>,
        events: Arc<RecordingEventSink>,
        clock: Arc<FixedClock>,
    }

    fn harness(now: DateTime<Utc>) -> Harness {
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        let events = Arc::new(RecordingEventSink::new());
        let clock = Arc::new(FixedClock::new(now));
        let engine = RoutingEngine::new(
            prefs.clone(),
            Arc::new(InMemoryCounterStore::new()),
            clock.clone(),
            events.clone(),
        );
        Harness {
            engine,
            prefs,
            events,
            clock,
        }
    }

    #[tokio::test]
    async fn test_allowed_decision_records_every_gate() {
        let h = harness(utc_at(12, 0));
        h.prefs.insert(create_test_preferences());

        let request = create_test_request(NotificationType::Transactional);
        let decision = h.engine.route(&request).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.channel, Some(ChannelKind::Email));
        assert_eq!(decision.reason, None);
        assert_eq!(
            decision.applied_rules,
            vec![
                Rule::ChannelSelected {
                    channel: ChannelKind::Email,
                    explicit: false
                },
                Rule::QuietHoursPassed,
                Rule::RateLimitPassed { remaining: 9 },
            ]
        );
        assert_eq!(h.events.events(), vec![RoutingEvent::Decision(decision)]);
    }

    #[tokio::test]
    async fn test_missing_preferences_is_not_found() {
        let h = harness(utc_at(12, 0));
        let err = h
            .engine
            .route(&create_test_request(NotificationType::Urgent))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotFound { entity: "preferences", .. }));
        assert!(h.events.is_empty());
    }

    #[tokio::test]
    async fn test_quiet_hours_block_carries_reopen_time() {
        let h = harness(utc_at(23, 30));
        h.prefs.insert(create_test_preferences());

        let decision = h
            .engine
            .route(&create_test_request(NotificationType::Marketing))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason_str(), Some("quiet hours"));
        assert_eq!(
            decision.applied_rules.last(),
            Some(&Rule::QuietHoursBlocked {
                quiet_until: Some(utc_at(8, 1) + Duration::days(1))
            })
        );

        let counter = h
            .engine
            .rate_limiter()
            .peek(TEST_USER_ID, ChannelKind::Email, NotificationType::Marketing)
            .await
            .unwrap();
        assert!(counter.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_after_budget() {
        let h = harness(utc_at(12, 0));
        h.prefs.insert(
            UserChannelPreferences::new(TEST_USER_ID, [ChannelKind::Sms]),
        );
        let request = create_test_request(NotificationType::Marketing);

        for _ in 0..2 {
            assert!(h.engine.route(&request).await.unwrap().allowed);
        }
        let blocked = h.engine.route(&request).await.unwrap();
        assert_eq!(blocked.reason, Some(BlockReason::RateLimitExceeded));
        assert_eq!(blocked.channel, Some(ChannelKind::Sms));
        assert_eq!(blocked.applied_rules.last(), Some(&Rule::RateLimitBlocked { limit: 2 }));

        h.clock.advance(Duration::hours(1));
        assert!(h.engine.route(&request).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_explicit_channel_is_recorded() {
        let h = harness(utc_at(12, 0));
        let request = create_test_request(NotificationType::Urgent).with_requested_channel(ChannelKind::Webhook);
        let decision = h
            .engine
            .evaluate(&request, &create_all_channel_preferences(), utc_at(12, 0))
            .await
            .unwrap();
        assert_eq!(
            decision.applied_rules.first(),
            Some(&Rule::ChannelSelected {
                channel: ChannelKind::Webhook,
                explicit: true
            })
        );
    }

    #[tokio::test]
    async fn test_bad_timezone_surfaces_as_validation_error() {
        let h = harness(utc_at(12, 0));
        let mut prefs = create_test_preferences().with_timezone("Not/AZone");
        prefs.quiet_hours = Some(QuietHours::new("22:00", "08:00"));
        let err = h
            .engine
            .evaluate(&create_test_request(NotificationType::Marketing), &prefs, utc_at(12, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_blank_user_is_rejected_before_lookup() {
        let h = harness(utc_at(12, 0));
        let request = NotificationRequest::new("", NotificationType::Urgent);
        assert!(matches!(
            h.engine.route(&request).await,
            Err(RoutingError::Validation(_))
        ));
    }
}
