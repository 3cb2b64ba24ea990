//! Collaborator seams for the routing engine
//!
//! The engine never talks to Redis or NATS directly. Everything it reads or
//! mutates goes through these traits, so the host wires in real adapters and
//! tests wire in the in-memory ones below.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use routing_common::{
    ChannelKind, ChannelStats, NotificationType, RateLimitCounter, RoutingEvent, RoutingResult,
    UserChannelPreferences,
};
use std::fmt;

use crate::rate_limit::{advance_counter, CounterCheck};

/// Key of one fixed-window rate-limit counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub user_id: String,
    pub channel: ChannelKind,
    pub notification_type: NotificationType,
}

impl RateLimitKey {
    pub fn new(user_id: &str, channel: ChannelKind, notification_type: NotificationType) -> Self {
        Self {
            user_id: user_id.to_string(),
            channel,
            notification_type,
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.user_id,
            self.channel.as_str(),
            self.notification_type.as_str()
        )
    }
}

/// Read-only snapshot source for user channel preferences
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_preferences(&self, user_id: &str) -> RoutingResult<Option<UserChannelPreferences>>;
}

/// Read-only source of historical per-channel delivery stats
#[async_trait]
pub trait ChannelStatsStore: Send + Sync {
    async fn get_stats(&self, channel: ChannelKind) -> RoutingResult<Option<ChannelStats>>;
}

/// Shared fixed-window counters.
///
/// `check_and_increment` must roll the window, compare and increment as one
/// atomic step per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RoutingResult<CounterCheck>;

    async fn get_counter(&self, key: &RateLimitKey) -> RoutingResult<Option<RateLimitCounter>>;
}

/// Memoized A/B assignments.
///
/// `get_or_insert` is a compare-and-set: the first writer's variant wins and
/// every caller gets the winning value back.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get_assignment(&self, test_id: &str, user_id: &str) -> RoutingResult<Option<String>>;

    async fn get_or_insert(&self, test_id: &str, user_id: &str, variant: &str) -> RoutingResult<String>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Fire-and-forget observability sink. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RoutingEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: RoutingEvent) {}
}

/// Keeps every published event in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RoutingEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RoutingEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: RoutingEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    preferences: DashMap<String, UserChannelPreferences>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, preferences: UserChannelPreferences) {
        self.preferences
            .insert(preferences.user_id.clone(), preferences);
    }

    pub fn remove(&self, user_id: &str) {
        self.preferences.remove(user_id);
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get_preferences(&self, user_id: &str) -> RoutingResult<Option<UserChannelPreferences>> {
        Ok(self.preferences.get(user_id).map(|p| p.value().clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStatsStore {
    stats: DashMap<ChannelKind, ChannelStats>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: ChannelKind, stats: ChannelStats) {
        self.stats.insert(channel, stats);
    }
}

#[async_trait]
impl ChannelStatsStore for InMemoryStatsStore {
    async fn get_stats(&self, channel: ChannelKind) -> RoutingResult<Option<ChannelStats>> {
        Ok(self.stats.get(&channel).map(|s| *s.value()))
    }
}

/// Counters held in a sharded map; the entry guard holds the shard lock for
/// the whole read-compare-increment.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<RateLimitKey, RateLimitCounter>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop counters whose window ended more than `idle_windows` windows ago
    pub fn prune_idle(&self, now: DateTime<Utc>, window: Duration, idle_windows: i32) -> usize {
        let before = self.counters.len();
        let horizon = window * idle_windows.max(1);
        self.counters
            .retain(|_, counter| now < counter.window_start + window + horizon);
        before - self.counters.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RoutingResult<CounterCheck> {
        let check = match self.counters.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let check = advance_counter(Some(entry.get()), limit, window, now);
                entry.insert(check.counter.clone());
                check
            }
            Entry::Vacant(entry) => {
                let check = advance_counter(None, limit, window, now);
                entry.insert(check.counter.clone());
                check
            }
        };
        Ok(check)
    }

    async fn get_counter(&self, key: &RateLimitKey) -> RoutingResult<Option<RateLimitCounter>> {
        Ok(self.counters.get(key).map(|c| c.value().clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAssignmentStore {
    assignments: DashMap<(String, String), String>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn get_assignment(&self, test_id: &str, user_id: &str) -> RoutingResult<Option<String>> {
        Ok(self
            .assignments
            .get(&(test_id.to_string(), user_id.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn get_or_insert(&self, test_id: &str, user_id: &str, variant: &str) -> RoutingResult<String> {
        let winner = self
            .assignments
            .entry((test_id.to_string(), user_id.to_string()))
            .or_insert_with(|| variant.to_string())
            .value()
            .clone();
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use routing_common::test_utilities::utc_at;
    use std::sync::Arc;

    fn key() -> RateLimitKey {
        RateLimitKey::new("u1", ChannelKind::Sms, NotificationType::Marketing)
    }

    #[test]
    fn test_rate_limit_key_formats_all_parts() {
        assert_eq!(key().to_string(), "u1:sms:marketing");
    }

    #[tokio::test]
    async fn test_counter_store_rolls_window() {
        let store = InMemoryCounterStore::new();
        let window = Duration::hours(1);
        let start = utc_at(10, 0);

        let first = store.check_and_increment(&key(), 2, window, start).await.unwrap();
        assert!(first.allowed);
        let second = store.check_and_increment(&key(), 2, window, start).await.unwrap();
        assert!(second.allowed);
        let third = store.check_and_increment(&key(), 2, window, start).await.unwrap();
        assert!(!third.allowed);

        let later = start + Duration::hours(1);
        let fresh = store.check_and_increment(&key(), 2, window, later).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.counter.count, 1);
        assert_eq!(fresh.counter.window_start, later);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counter_store_never_double_counts() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = utc_at(12, 0);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_and_increment(&key(), 5, Duration::hours(1), now)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(store.get_counter(&key()).await.unwrap().unwrap().count, 5);
    }

    #[tokio::test]
    async fn test_counter_store_prunes_idle_keys() {
        let store = InMemoryCounterStore::new();
        let window = Duration::hours(1);
        store
            .check_and_increment(&key(), 2, window, utc_at(0, 0))
            .await
            .unwrap();
        assert_eq!(store.prune_idle(utc_at(1, 30), window, 2), 0);
        assert_eq!(store.prune_idle(utc_at(3, 0), window, 2), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_assignment_store_first_writer_wins() {
        let store = Arc::new(InMemoryAssignmentStore::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let candidate = format!("variant-{}", i);
                store.get_or_insert("t1", "u1", &candidate).await.unwrap()
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            winners.push(handle.await.unwrap());
        }
        winners.dedup();
        assert_eq!(winners.len(), 1);
        assert_eq!(
            store.get_assignment("t1", "u1").await.unwrap(),
            Some(winners[0].clone())
        );
    }

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::new(utc_at(8, 0));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), utc_at(9, 30));
    }
}
