//! Fixed-window rate limiting per (user, channel, notification type)

use chrono::{DateTime, Duration, Utc};
use routing_common::{ChannelKind, NotificationType, RateLimitCounter, RateLimitOutcome, RoutingResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::runtime::{CounterStore, RateLimitKey};

/// Limit used for every (channel, type) pair missing from the table
pub const DEFAULT_LIMIT: u32 = 10;

/// Result of one atomic counter step, including the counter as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCheck {
    pub allowed: bool,
    pub remaining: u32,
    pub counter: RateLimitCounter,
}

impl CounterCheck {
    pub fn outcome(&self) -> RateLimitOutcome {
        RateLimitOutcome {
            allowed: self.allowed,
            remaining: self.remaining,
        }
    }
}

/// One read-compare-increment step over a counter.
///
/// Stores call this while holding whatever per-key lock they use; the Redis
/// script mirrors the same rules.
pub fn advance_counter(
    existing: Option<&RateLimitCounter>,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> CounterCheck {
    let mut counter = match existing {
        Some(counter) if now < counter.window_start + window => RateLimitCounter {
            limit,
            ..counter.clone()
        },
        _ => RateLimitCounter {
            window_start: now,
            count: 0,
            limit,
        },
    };

    if counter.count < limit {
        counter.count += 1;
        CounterCheck {
            allowed: true,
            remaining: limit - counter.count,
            counter,
        }
    } else {
        CounterCheck {
            allowed: false,
            remaining: 0,
            counter,
        }
    }
}

/// Per-hour limits keyed by (channel, notification type)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitTable {
    limits: HashMap<(ChannelKind, NotificationType), u32>,
    default_limit: u32,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        let limits = HashMap::from([
            ((ChannelKind::Sms, NotificationType::Urgent), 5),
            ((ChannelKind::Sms, NotificationType::Transactional), 10),
            ((ChannelKind::Sms, NotificationType::Marketing), 2),
            ((ChannelKind::Email, NotificationType::Marketing), 5),
            ((ChannelKind::Push, NotificationType::Marketing), 3),
            ((ChannelKind::Webhook, NotificationType::Transactional), 200),
            ((ChannelKind::Webhook, NotificationType::Urgent), 100),
        ]);
        Self {
            limits,
            default_limit: DEFAULT_LIMIT,
        }
    }
}

impl RateLimitTable {
    pub fn with_limit(mut self, channel: ChannelKind, notification_type: NotificationType, limit: u32) -> Self {
        self.limits.insert((channel, notification_type), limit);
        self
    }

    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn limit_for(&self, channel: ChannelKind, notification_type: NotificationType) -> u32 {
        self.limits
            .get(&(channel, notification_type))
            .copied()
            .unwrap_or(self.default_limit)
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    table: RateLimitTable,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            table: RateLimitTable::default(),
            window: Duration::hours(1),
        }
    }

    pub fn with_table(mut self, table: RateLimitTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn table(&self) -> &RateLimitTable {
        &self.table
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Charge one send against the counter if budget remains
    pub async fn check_and_increment(
        &self,
        user_id: &str,
        channel: ChannelKind,
        notification_type: NotificationType,
        now: DateTime<Utc>,
    ) -> RoutingResult<RateLimitOutcome> {
        let key = RateLimitKey::new(user_id, channel, notification_type);
        let limit = self.table.limit_for(channel, notification_type);
        let check = self
            .store
            .check_and_increment(&key, limit, self.window, now)
            .await?;

        debug!(
            "Rate limit {}: count={}/{} allowed={}",
            key, check.counter.count, limit, check.allowed
        );

        Ok(check.outcome())
    }

    /// Current counter without charging it
    pub async fn peek(
        &self,
        user_id: &str,
        channel: ChannelKind,
        notification_type: NotificationType,
    ) -> RoutingResult<Option<RateLimitCounter>> {
        let key = RateLimitKey::new(user_id, channel, notification_type);
        self.store.get_counter(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InMemoryCounterStore;
    use pretty_assertions::assert_eq;
    use routing_common::test_utilities::utc_at;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryCounterStore::new()))
    }

    #[test]
    fn test_default_table() {
        let table = RateLimitTable::default();
        assert_eq!(table.limit_for(ChannelKind::Sms, NotificationType::Urgent), 5);
        assert_eq!(table.limit_for(ChannelKind::Sms, NotificationType::Marketing), 2);
        assert_eq!(table.limit_for(ChannelKind::Webhook, NotificationType::Transactional), 200);
        assert_eq!(table.limit_for(ChannelKind::Email, NotificationType::Urgent), DEFAULT_LIMIT);
        assert_eq!(table.limit_for(ChannelKind::Push, NotificationType::Transactional), DEFAULT_LIMIT);
    }

    #[test]
    fn test_advance_counter_denies_without_incrementing() {
        let now = utc_at(10, 0);
        let full = RateLimitCounter {
            window_start: now,
            count: 2,
            limit: 2,
        };
        let check = advance_counter(Some(&full), 2, Duration::hours(1), now + Duration::minutes(59));
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);
        assert_eq!(check.counter.count, 2);
    }

    #[test]
    fn test_advance_counter_resets_exactly_at_window_end() {
        let start = utc_at(10, 0);
        let full = RateLimitCounter {
            window_start: start,
            count: 2,
            limit: 2,
        };
        let check = advance_counter(Some(&full), 2, Duration::hours(1), start + Duration::hours(1));
        assert!(check.allowed);
        assert_eq!(check.counter.count, 1);
        assert_eq!(check.counter.window_start, start + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_boundary_n_allowed_then_denied() {
        let limiter = limiter();
        let now = utc_at(9, 0);

        for expected_remaining in [1, 0] {
            let outcome = limiter
                .check_and_increment("u1", ChannelKind::Sms, NotificationType::Marketing, now)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                RateLimitOutcome {
                    allowed: true,
                    remaining: expected_remaining
                }
            );
        }

        let denied = limiter
            .check_and_increment("u1", ChannelKind::Sms, NotificationType::Marketing, now)
            .await
            .unwrap();
        assert!(!denied.allowed);

        let later = now + Duration::hours(1) + Duration::seconds(1);
        let fresh = limiter
            .check_and_increment("u1", ChannelKind::Sms, NotificationType::Marketing, later)
            .await
            .unwrap();
        assert!(fresh.allowed);
        let counter = limiter
            .peek("u1", ChannelKind::Sms, NotificationType::Marketing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        let now = utc_at(9, 0);
        for _ in 0..2 {
            limiter
                .check_and_increment("u1", ChannelKind::Sms, NotificationType::Marketing, now)
                .await
                .unwrap();
        }

        let other_type = limiter
            .check_and_increment("u1", ChannelKind::Sms, NotificationType::Urgent, now)
            .await
            .unwrap();
        assert!(other_type.allowed);
        let other_user = limiter
            .check_and_increment("u2", ChannelKind::Sms, NotificationType::Marketing, now)
            .await
            .unwrap();
        assert!(other_user.allowed);
    }

    #[tokio::test]
    async fn test_table_and_window_overrides() {
        let table = RateLimitTable::default().with_limit(ChannelKind::Email, NotificationType::Urgent, 1);
        let limiter = limiter().with_table(table).with_window(Duration::minutes(5));
        let now = utc_at(9, 0);

        assert!(limiter
            .check_and_increment("u1", ChannelKind::Email, NotificationType::Urgent, now)
            .await
            .unwrap()
            .allowed);
        assert!(!limiter
            .check_and_increment("u1", ChannelKind::Email, NotificationType::Urgent, now + Duration::minutes(4))
            .await
            .unwrap()
            .allowed);
        assert!(limiter
            .check_and_increment("u1", ChannelKind::Email, NotificationType::Urgent, now + Duration::minutes(5))
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn test_peek_does_not_create_counter() {
        let limiter = limiter();
        assert!(limiter
            .peek("nobody", ChannelKind::Push, NotificationType::Urgent)
            .await
            .unwrap()
            .is_none());
    }
}
