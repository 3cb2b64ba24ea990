//! Delivery optimization
//!
//! Each optimization kind takes free-form JSON parameters and produces a JSON
//! result. Whatever goes wrong inside a kind is captured on the returned
//! `OptimizationResult`; callers always get a result back, and a batch of
//! optimizations fails entry by entry.

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use futures::future::join_all;
use routing_common::{
    parse_clock_time, parse_timezone, ABTest, BackoffStrategy, ChannelKind, ChannelStats, DeliveryAttempt,
    DeliveryPlan, NotificationRequest, OptimizationKind, OptimizationRequest, OptimizationResult, RoutingError,
    RoutingEvent, RoutingResult, UserChannelPreferences, Validate, ValidationError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::quiet_hours::local_to_utc;
use crate::retry::RetryPlanner;
use crate::routing::RoutingEngine;
use crate::runtime::{AssignmentStore, ChannelStatsStore};
use crate::variant::{bucket_for, VariantAssigner};

pub const DEFAULT_MIN_SCORE: f64 = 50.0;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_DELAY_SECS: u64 = 60;
/// Upper bound on `max_retries` accepted from request parameters
pub const MAX_RETRIES_LIMIT: u32 = 20;

const SUCCESS_WEIGHT: f64 = 0.4;
const DELIVERY_TIME_WEIGHT: f64 = 0.3;
const COST_WEIGHT: f64 = 0.2;
const PREFERENCE_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Deserialize)]
pub struct BusinessHours {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingParams {
    pub preferred_time: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub business_hours: Option<BusinessHours>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelSelectionParams {
    #[serde(default)]
    pub channels: Option<Vec<ChannelKind>>,
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonalizationParams {
    pub test: ABTest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchParams {
    pub recipients: Vec<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryParams {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_secs: Option<u64>,
    #[serde(default)]
    pub strategy: Option<BackoffStrategy>,
}

/// Weighted score of one channel, each part on a 0-100 scale
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ChannelScore {
    pub channel: ChannelKind,
    pub score: f64,
    pub success_score: f64,
    pub delivery_time_score: f64,
    pub cost_score: f64,
    pub preference_score: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelSelectionOutcome {
    pub optimal_channels: Vec<ChannelKind>,
    pub scores: Vec<ChannelScore>,
    pub unscored: Vec<ChannelKind>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub recipients: Vec<String>,
    pub delay_secs: u64,
}

pub struct DeliveryOptimizer {
    routing: Arc<RoutingEngine>,
    stats: Arc<dyn ChannelStatsStore>,
    assigner: VariantAssigner,
    planner: RetryPlanner,
}

impl DeliveryOptimizer {
    pub fn new(
        routing: Arc<RoutingEngine>,
        stats: Arc<dyn ChannelStatsStore>,
        assignments: Arc<dyn AssignmentStore>,
    ) -> Self {
        Self {
            routing,
            stats,
            assigner: VariantAssigner::new(assignments),
            planner: RetryPlanner::new(),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    /// Run one optimization and publish its result
    pub async fn optimize(&self, notification: &NotificationRequest, kind: &str, parameters: &Value) -> OptimizationResult {
        let clock = self.routing.clock();
        let mut result = OptimizationResult::pending(notification.id, kind, clock.now());

        match self.run(notification, kind, parameters).await {
            Ok(value) => result.complete(value, clock.now()),
            Err(e) => {
                warn!(
                    "Optimization {} failed for notification {}: {}",
                    kind, notification.id, e
                );
                result.fail(failure_message(&e), clock.now());
            }
        }

        debug!("Optimization {} for {} -> {:?}", kind, notification.id, result.status);
        self.routing
            .events()
            .publish(RoutingEvent::Optimization(result.clone()));
        result
    }

    /// Run a batch; each entry succeeds or fails on its own
    pub async fn optimize_all(&self, requests: &[OptimizationRequest]) -> Vec<OptimizationResult> {
        join_all(
            requests
                .iter()
                .map(|request| self.optimize(&request.notification, &request.kind, &request.parameters)),
        )
        .await
    }

    /// Route the request and, when allowed, build the attempt for transport
    pub async fn plan_delivery(&self, request: &NotificationRequest) -> RoutingResult<DeliveryPlan> {
        let decision = self.routing.route(request).await?;

        let attempt = match (decision.allowed, decision.channel) {
            (true, Some(channel)) => Some(DeliveryAttempt {
                notification_id: request.id,
                user_id: request.user_id.clone(),
                channel,
                send_at: decision.evaluated_at,
                retry_plan: self.planner.plan_or_default(None, None, None),
                payload: request.payload.clone(),
            }),
            _ => None,
        };

        if let Some(attempt) = &attempt {
            info!(
                "Planned delivery of {} via {} with {} retries",
                attempt.notification_id,
                attempt.channel,
                attempt.retry_plan.max_retries
            );
        }

        Ok(DeliveryPlan { decision, attempt })
    }

    async fn run(&self, notification: &NotificationRequest, kind: &str, parameters: &Value) -> RoutingResult<Value> {
        let kind: OptimizationKind = kind.parse()?;

        match kind {
            OptimizationKind::Timing => {
                let params: TimingParams = decode_params(parameters)?;
                let now = self.routing.clock().now();
                let timezone = match params.timezone.clone() {
                    Some(timezone) => timezone,
                    None => self
                        .optional_preferences(&notification.user_id)
                        .await?
                        .map(|prefs| prefs.timezone)
                        .unwrap_or_else(|| "UTC".to_string()),
                };
                optimize_timing(&params, &timezone, now)
            }
            OptimizationKind::ChannelSelection => {
                let params: ChannelSelectionParams = decode_params(parameters)?;
                let outcome = self.select_channels(notification, &params).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            OptimizationKind::Personalization => {
                let params: PersonalizationParams = decode_params(parameters)?;
                let assignment = self
                    .assigner
                    .assign_for_test(&params.test, &notification.user_id)
                    .await?;
                let configuration = params
                    .test
                    .variant(&assignment.variant)
                    .map(|v| v.configuration.clone())
                    .unwrap_or(Value::Null);
                Ok(json!({
                    "test_id": assignment.test_id,
                    "variant": assignment.variant,
                    "configuration": configuration,
                    "bucket": bucket_for(&notification.user_id),
                }))
            }
            OptimizationKind::BatchProcessing => {
                let params: BatchParams = decode_params(parameters)?;
                let batches = plan_batches(
                    &params.recipients,
                    params.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                    params.batch_delay_secs.unwrap_or(DEFAULT_BATCH_DELAY_SECS),
                )?;
                Ok(json!({
                    "total_recipients": params.recipients.len(),
                    "batch_count": batches.len(),
                    "batches": batches,
                }))
            }
            OptimizationKind::RetryStrategy => {
                let params: RetryParams = decode_params(parameters)?;
                if let Some(max_retries) = params.max_retries.filter(|n| *n > MAX_RETRIES_LIMIT) {
                    return Err(invalid_param(
                        "max_retries",
                        format!("{} exceeds the limit of {}", max_retries, MAX_RETRIES_LIMIT),
                    ));
                }
                let plan = self.planner.plan_or_default(
                    params.max_retries,
                    params.base_delay_secs.map(std::time::Duration::from_secs),
                    params.strategy,
                );
                Ok(serde_json::to_value(plan)?)
            }
        }
    }

    async fn optional_preferences(&self, user_id: &str) -> RoutingResult<Option<UserChannelPreferences>> {
        match self.routing.load_preferences(user_id).await {
            Ok(prefs) => Ok(Some(prefs)),
            Err(RoutingError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn select_channels(
        &self,
        notification: &NotificationRequest,
        params: &ChannelSelectionParams,
    ) -> RoutingResult<ChannelSelectionOutcome> {
        let min_score = params.min_score.unwrap_or(DEFAULT_MIN_SCORE);
        if !min_score.is_finite() {
            return Err(invalid_param("min_score", "must be a finite number"));
        }
        if let Some(max_cost) = params.max_cost {
            if !max_cost.is_finite() || max_cost < 0.0 {
                return Err(invalid_param("max_cost", "must be a non-negative number"));
            }
        }

        let preferences = self.optional_preferences(&notification.user_id).await?;
        let candidates: BTreeSet<ChannelKind> = match (&params.channels, &preferences) {
            (Some(channels), _) => channels.iter().copied().collect(),
            (None, Some(prefs)) => prefs.enabled_channels.clone(),
            (None, None) => return Err(RoutingError::not_found("preferences", &notification.user_id)),
        };

        let mut measured = Vec::new();
        let mut unscored = Vec::new();
        for channel in candidates {
            match self.stats.get_stats(channel).await? {
                Some(stats) => match stats.validate() {
                    Ok(()) => measured.push((channel, stats)),
                    Err(e) => {
                        warn!("Ignoring stats for channel {}: {}", channel, e);
                        unscored.push(channel);
                    }
                },
                None => unscored.push(channel),
            }
        }

        let enabled = preferences.map(|p| p.enabled_channels).unwrap_or_default();
        let scores = score_channels(&measured, notification.requested_channel, &enabled);
        let (optimal_channels, total_cost) = accept_greedily(&scores, min_score, params.max_cost);

        Ok(ChannelSelectionOutcome {
            optimal_channels,
            scores,
            unscored,
            total_cost,
        })
    }
}

/// Score measured channels; result is sorted best first, ties in channel order
pub fn score_channels(
    measured: &[(ChannelKind, ChannelStats)],
    requested: Option<ChannelKind>,
    enabled: &BTreeSet<ChannelKind>,
) -> Vec<ChannelScore> {
    let max_cost = measured
        .iter()
        .map(|(_, stats)| stats.cost)
        .fold(0.0_f64, f64::max);

    let mut scores: Vec<ChannelScore> = measured
        .iter()
        .map(|(channel, stats)| {
            let success_score = (stats.success_rate * 100.0).clamp(0.0, 100.0);
            let delivery_time_score = (100.0 - stats.avg_delivery_time_secs).clamp(0.0, 100.0);
            let cost_score = if max_cost > 0.0 {
                (100.0 * (1.0 - stats.cost / max_cost)).clamp(0.0, 100.0)
            } else {
                100.0
            };
            let preference_score = if requested == Some(*channel) {
                100.0
            } else if enabled.contains(channel) {
                75.0
            } else {
                0.0
            };

            ChannelScore {
                channel: *channel,
                score: success_score * SUCCESS_WEIGHT
                    + delivery_time_score * DELIVERY_TIME_WEIGHT
                    + cost_score * COST_WEIGHT
                    + preference_score * PREFERENCE_WEIGHT,
                success_score,
                delivery_time_score,
                cost_score,
                preference_score,
                cost: stats.cost,
            }
        })
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.channel.cmp(&b.channel))
    });
    scores
}

/// Accept channels best first while they clear the threshold and the budget.
/// NaN scores and negative costs are never accepted.
pub fn accept_greedily(scores: &[ChannelScore], min_score: f64, max_cost: Option<f64>) -> (Vec<ChannelKind>, f64) {
    let mut accepted = Vec::new();
    let mut total_cost = 0.0;

    for candidate in scores {
        if candidate.score.is_nan() || candidate.score < min_score || candidate.cost.is_nan() || candidate.cost < 0.0 {
            continue;
        }
        if max_cost.is_some_and(|budget| total_cost + candidate.cost > budget) {
            continue;
        }
        total_cost += candidate.cost;
        accepted.push(candidate.channel);
    }

    (accepted, total_cost)
}

/// Next occurrence of the preferred local time, clamped into business hours
pub fn optimize_timing(params: &TimingParams, timezone: &str, now: DateTime<Utc>) -> RoutingResult<Value> {
    let tz = parse_timezone(timezone)?;
    let preferred = parse_clock_time(&params.preferred_time)?;
    let business = match &params.business_hours {
        Some(hours) => {
            let start = parse_clock_time(&hours.start)?;
            let end = parse_clock_time(&hours.end)?;
            if start >= end {
                return Err(invalid_param("business_hours", "start must be before end"));
            }
            Some((start, end))
        }
        None => None,
    };

    let local_now = now.with_timezone(&tz).naive_local();
    let mut candidate = at_local_minute(local_now, 0, preferred)?;
    if candidate < local_now {
        candidate = at_local_minute(local_now, 1, preferred)?;
    }

    let mut adjusted = false;
    if let Some((start, end)) = business {
        let minute = (candidate.hour() * 60 + candidate.minute()) as u16;
        if minute < start {
            candidate = at_local_minute(candidate, 0, start)?;
            adjusted = true;
        } else if minute > end {
            candidate = at_local_minute(candidate, 1, start)?;
            adjusted = true;
        }
    }

    let send_at = local_to_utc(&tz, candidate);
    Ok(json!({
        "send_at": send_at,
        "local_time": candidate.format("%Y-%m-%dT%H:%M").to_string(),
        "timezone": tz.name(),
        "adjusted_for_business_hours": adjusted,
    }))
}

/// Split recipients into chunks staggered by `delay_secs` each
pub fn plan_batches(recipients: &[String], batch_size: usize, delay_secs: u64) -> RoutingResult<Vec<Batch>> {
    if batch_size == 0 {
        return Err(invalid_param("batch_size", "must be at least 1"));
    }

    Ok(recipients
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            recipients: chunk.to_vec(),
            delay_secs: delay_secs.saturating_mul(index as u64),
        })
        .collect())
}

fn at_local_minute(base: NaiveDateTime, days_ahead: i64, minute_of_day: u16) -> RoutingResult<NaiveDateTime> {
    let date = base.date() + Duration::days(days_ahead);
    date.and_hms_opt(u32::from(minute_of_day / 60), u32::from(minute_of_day % 60), 0)
        .ok_or_else(|| invalid_param("time", format!("minute {} out of range", minute_of_day)))
}

fn decode_params<T: DeserializeOwned>(parameters: &Value) -> RoutingResult<T> {
    let value = if parameters.is_null() {
        json!({})
    } else {
        parameters.clone()
    };
    serde_json::from_value(value).map_err(|e| invalid_param("parameters", e.to_string()))
}

fn invalid_param(field: &str, reason: impl Into<String>) -> RoutingError {
    ValidationError::InvalidParameter {
        field: field.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn failure_message(error: &RoutingError) -> String {
    match error {
        RoutingError::Validation(inner) => inner.to_string(),
        other => other.to_string(),
    }
}
