//! Request handling independent of the NATS transport
//!
//! Each request yields a reply payload and, for allowed routing decisions, a
//! delivery attempt to hand to the channel's transport subject.

use notification_router::DeliveryOptimizer;
use routing_common::{DeliveryPlan, NotificationRequest, OptimizationRequest};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Message to publish on a transport subject
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub reply: Vec<u8>,
    pub dispatch: Option<Dispatch>,
}

impl HandlerOutcome {
    fn reply_only(reply: Vec<u8>) -> Self {
        Self { reply, dispatch: None }
    }
}

/// Error body sent back to the requester
#[derive(Debug, Serialize)]
pub struct ErrorReply {
    pub error: &'static str,
    pub message: String,
}

#[derive(Clone)]
pub struct RequestHandler {
    optimizer: Arc<DeliveryOptimizer>,
}

impl RequestHandler {
    pub fn new(optimizer: Arc<DeliveryOptimizer>) -> Self {
        Self { optimizer }
    }

    /// Route a notification and build its transport hand-off when allowed
    pub async fn handle_route(&self, payload: &[u8]) -> HandlerOutcome {
        let request: NotificationRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse routing request: {}", e);
                return HandlerOutcome::reply_only(error_reply("invalid_request", e.to_string()));
            }
        };

        let plan: DeliveryPlan = match self.optimizer.plan_delivery(&request).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Routing failed for notification {}: {}", request.id, e);
                return HandlerOutcome::reply_only(error_reply(e.code(), e.to_string()));
            }
        };

        let dispatch = plan.attempt.as_ref().map(|attempt| Dispatch {
            subject: attempt.channel.nats_subject(),
            payload: encode(attempt),
        });
        if let Some(dispatch) = &dispatch {
            debug!("Dispatching notification {} to {}", request.id, dispatch.subject);
        }

        HandlerOutcome {
            reply: encode(&plan),
            dispatch,
        }
    }

    /// Run one optimization; failures come back inside the result
    pub async fn handle_optimize(&self, payload: &[u8]) -> HandlerOutcome {
        let request: OptimizationRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse optimization request: {}", e);
                return HandlerOutcome::reply_only(error_reply("invalid_request", e.to_string()));
            }
        };

        let result = self
            .optimizer
            .optimize(&request.notification, &request.kind, &request.parameters)
            .await;
        HandlerOutcome::reply_only(encode(&result))
    }
}

/// Reply for a request whose decision was made but whose hand-off to the
/// transport could not be published
pub fn dispatch_failed_reply(error: &impl std::fmt::Display) -> Vec<u8> {
    error_reply("dispatch_failed", error.to_string())
}

fn error_reply(code: &'static str, message: String) -> Vec<u8> {
    encode(&ErrorReply { error: code, message })
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        error!("Failed to serialize reply: {}", e);
        br#"{"error":"serialization_error"}"#.to_vec()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notification_router::{
        FixedClock, InMemoryAssignmentStore, InMemoryCounterStore, InMemoryPreferenceStore, InMemoryStatsStore,
        NoopEventSink, RoutingEngine,
    };
    use pretty_assertions::assert_eq;
    use routing_common::test_utilities::{create_test_preferences, create_test_request, utc_at};
    use routing_common::{
        DeliveryAttempt, NotificationType, OptimizationResult, OptimizationStatus, RoutingDecision,
    };
    use serde_json::{json, Value};

    fn handler() -> RequestHandler {
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        prefs.insert(create_test_preferences());
        let engine = Arc::new(RoutingEngine::new(
            prefs,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(FixedClock::new(utc_at(12, 0))),
            Arc::new(NoopEventSink),
        ));
        let optimizer = DeliveryOptimizer::new(
            engine,
            Arc::new(InMemoryStatsStore::new()),
            Arc::new(InMemoryAssignmentStore::new()),
        );
        RequestHandler::new(Arc::new(optimizer))
    }

    #[tokio::test]
    async fn test_allowed_route_dispatches_to_channel_subject() {
        let request = create_test_request(NotificationType::Urgent);
        let outcome = handler()
            .handle_route(&serde_json::to_vec(&request).unwrap())
            .await;

        let dispatch = outcome.dispatch.unwrap();
        assert_eq!(dispatch.subject, "notifications.send.immediate.push");
        let attempt: DeliveryAttempt = serde_json::from_slice(&dispatch.payload).unwrap();
        assert_eq!(attempt.notification_id, request.id);

        let plan: DeliveryPlan = serde_json::from_slice(&outcome.reply).unwrap();
        assert!(plan.decision.allowed);
    }

    #[tokio::test]
    async fn test_missing_preferences_replies_with_error_code() {
        let request = NotificationRequest::new("stranger", NotificationType::Urgent);
        let outcome = handler()
            .handle_route(&serde_json::to_vec(&request).unwrap())
            .await;

        assert!(outcome.dispatch.is_none());
        let reply: Value = serde_json::from_slice(&outcome.reply).unwrap();
        assert_eq!(reply["error"], "not_found");
    }

    #[tokio::test]
    async fn test_blocked_route_has_no_dispatch() {
        let request = create_test_request(NotificationType::Marketing);
        let handler = handler();
        let payload = serde_json::to_vec(&request).unwrap();

        // email/marketing allows 5 per hour
        for _ in 0..5 {
            assert!(handler.handle_route(&payload).await.dispatch.is_some());
        }
        let outcome = handler.handle_route(&payload).await;
        assert!(outcome.dispatch.is_none());
        let plan: DeliveryPlan = serde_json::from_slice(&outcome.reply).unwrap();
        let decision: RoutingDecision = plan.decision;
        assert_eq!(decision.reason_str(), Some("rate limit exceeded"));
    }

    #[test]
    fn test_dispatch_failure_reply_carries_code() {
        let reply: Value = serde_json::from_slice(&dispatch_failed_reply(&"broker unavailable")).unwrap();
        assert_eq!(reply["error"], "dispatch_failed");
        assert_eq!(reply["message"], "broker unavailable");
    }

    #[tokio::test]
    async fn test_garbage_payload_is_invalid_request() {
        let outcome = handler().handle_route(b"not json").await;
        let reply: Value = serde_json::from_slice(&outcome.reply).unwrap();
        assert_eq!(reply["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_optimize_replies_with_result() {
        let payload = serde_json::to_vec(&json!({
            "notification": create_test_request(NotificationType::Transactional),
            "kind": "retry_strategy",
            "parameters": {"strategy": "fixed", "base_delay_secs": 15}
        }))
        .unwrap();

        let outcome = handler().handle_optimize(&payload).await;
        let result: OptimizationResult = serde_json::from_slice(&outcome.reply).unwrap();
        assert_eq!(result.status, OptimizationStatus::Completed);
        assert_eq!(result.result.unwrap()["delays_secs"], json!([15, 15, 15]));
    }
}
