//! Redis-backed collaborators for the routing engine
//!
//! Key layout:
//! ```text
//! routing:prefs:{user_id}                      # UserChannelPreferences JSON
//! routing:stats:{channel}                      # ChannelStats JSON
//! routing:ratelimit:{user}:{channel}:{type}    # hash: window_start, count, limit
//! routing:assignment:{test_id}:{user_id}       # variant name
//! ```
//!
//! Counter and assignment updates run as Lua scripts so each one is a single
//! atomic step on the server.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use notification_router::{
    AssignmentStore, ChannelStatsStore, CounterCheck, CounterStore, PreferenceStore, RateLimitKey,
};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use routing_common::{
    ChannelKind, ChannelStats, RateLimitCounter, RoutingError, RoutingResult, UserChannelPreferences,
};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::ProviderError;

const RATE_LIMIT_SCRIPT: &str = r#"
local start = tonumber(redis.call('HGET', KEYS[1], 'window_start'))
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

if start == nil or now >= start + window then
    start = now
    count = 0
end

local allowed = 0
if count < limit then
    count = count + 1
    allowed = 1
end

redis.call('HSET', KEYS[1], 'window_start', start, 'count', count, 'limit', limit)
redis.call('PEXPIRE', KEYS[1], start + window - now)
return {allowed, count, start}
"#;

const ASSIGNMENT_SCRIPT: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 1 then
    return ARGV[1]
end
return redis.call('GET', KEYS[1])
"#;

pub fn preferences_key(user_id: &str) -> String {
    format!("routing:prefs:{}", user_id)
}

pub fn stats_key(channel: ChannelKind) -> String {
    format!("routing:stats:{}", channel.as_str())
}

pub fn rate_limit_key(key: &RateLimitKey) -> String {
    format!("routing:ratelimit:{}", key)
}

pub fn assignment_key(test_id: &str, user_id: &str) -> String {
    format!("routing:assignment:{}:{}", test_id, user_id)
}

/// Redis store with connection management
#[derive(Clone)]
pub struct RedisRoutingStore {
    connection_manager: ConnectionManager,
    timeout: Duration,
    rate_limit_script: Script,
    assignment_script: Script,
}

impl RedisRoutingStore {
    /// Create a new store with connection manager
    pub async fn new(redis_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::open(redis_url)
            .map_err(|e| ProviderError::config(format!("Invalid Redis URL: {}", e)))?;

        let connection_manager = ConnectionManager::new(client).await?;

        Ok(Self {
            connection_manager,
            timeout,
            rate_limit_script: Script::new(RATE_LIMIT_SCRIPT),
            assignment_script: Script::new(ASSIGNMENT_SCRIPT),
        })
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result.map_err(ProviderError::from),
            Err(_) => Err(ProviderError::Timeout(self.timeout)),
        }
    }

    /// Store a preference snapshot
    pub async fn put_preferences(&self, preferences: &UserChannelPreferences) -> Result<(), ProviderError> {
        let key = preferences_key(&preferences.user_id);
        let json_data = serde_json::to_string(preferences)?;
        let mut conn = self.connection_manager.clone();

        self.bounded(conn.set::<_, _, ()>(&key, json_data)).await?;
        debug!("Stored preferences for user: {}", preferences.user_id);
        Ok(())
    }

    /// Store delivery stats for a channel
    pub async fn put_stats(&self, channel: ChannelKind, stats: &ChannelStats) -> Result<(), ProviderError> {
        let key = stats_key(channel);
        let json_data = serde_json::to_string(stats)?;
        let mut conn = self.connection_manager.clone();

        self.bounded(conn.set::<_, _, ()>(&key, json_data)).await?;
        debug!("Stored stats for channel: {}", channel.as_str());
        Ok(())
    }

    /// Check if Redis connection is healthy
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        let mut conn = self.connection_manager.clone();
        let cmd = redis::cmd("PING");
        match self.bounded(cmd.query_async::<_, String>(&mut conn)).await {
            Ok(_) => {
                debug!("Redis health check passed");
                Ok(())
            }
            Err(e) => {
                error!("Redis health check failed: {}", e);
                Err(e)
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ProviderError> {
        let mut conn = self.connection_manager.clone();
        let raw = self.bounded(conn.get::<_, Option<String>>(key)).await.map_err(|e| {
            error!("Redis error reading {}: {}", key, e);
            e
        })?;

        match raw {
            Some(json_data) => serde_json::from_str(&json_data).map(Some).map_err(|e| {
                error!("Failed to deserialize {}: {}", key, e);
                ProviderError::from(e)
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PreferenceStore for RedisRoutingStore {
    async fn get_preferences(&self, user_id: &str) -> RoutingResult<Option<UserChannelPreferences>> {
        debug!("Fetching preferences for user: {}", user_id);
        Ok(self.get_json(&preferences_key(user_id)).await?)
    }
}

#[async_trait]
impl ChannelStatsStore for RedisRoutingStore {
    async fn get_stats(&self, channel: ChannelKind) -> RoutingResult<Option<ChannelStats>> {
        Ok(self.get_json(&stats_key(channel)).await?)
    }
}

#[async_trait]
impl CounterStore for RedisRoutingStore {
    async fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: ChronoDuration,
        now: DateTime<Utc>,
    ) -> RoutingResult<CounterCheck> {
        let redis_key = rate_limit_key(key);
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.rate_limit_script.prepare_invoke();
        invocation
            .key(&redis_key)
            .arg(now.timestamp_millis())
            .arg(window.num_milliseconds())
            .arg(limit);

        let reply: Vec<i64> = self
            .bounded(invocation.invoke_async(&mut conn))
            .await
            .map_err(|e| {
                error!("Rate limit script failed for {}: {}", redis_key, e);
                e
            })?;

        let &[allowed, count, window_start] = reply.as_slice() else {
            return Err(RoutingError::store(format!("unexpected rate limit reply: {:?}", reply)));
        };
        let count = u32::try_from(count).unwrap_or(u32::MAX);

        Ok(CounterCheck {
            allowed: allowed == 1,
            remaining: limit.saturating_sub(count),
            counter: RateLimitCounter {
                window_start: from_millis(window_start),
                count,
                limit,
            },
        })
    }

    async fn get_counter(&self, key: &RateLimitKey) -> RoutingResult<Option<RateLimitCounter>> {
        let redis_key = rate_limit_key(key);
        let mut conn = self.connection_manager.clone();
        let fields: HashMap<String, i64> = self.bounded(conn.hgetall(&redis_key)).await?;

        let (Some(window_start), Some(count)) = (fields.get("window_start"), fields.get("count")) else {
            return Ok(None);
        };

        Ok(Some(RateLimitCounter {
            window_start: from_millis(*window_start),
            count: u32::try_from(*count).unwrap_or(u32::MAX),
            limit: fields
                .get("limit")
                .and_then(|l| u32::try_from(*l).ok())
                .unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl AssignmentStore for RedisRoutingStore {
    async fn get_assignment(&self, test_id: &str, user_id: &str) -> RoutingResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        let key = assignment_key(test_id, user_id);
        Ok(self.bounded(conn.get::<_, Option<String>>(&key)).await?)
    }

    async fn get_or_insert(&self, test_id: &str, user_id: &str, variant: &str) -> RoutingResult<String> {
        let mut conn = self.connection_manager.clone();
        let key = assignment_key(test_id, user_id);
        let mut invocation = self.assignment_script.prepare_invoke();
        invocation.key(&key).arg(variant);

        let winner: String = self.bounded(invocation.invoke_async(&mut conn)).await?;
        debug!("Assignment {} -> {}", key, winner);
        Ok(winner)
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
