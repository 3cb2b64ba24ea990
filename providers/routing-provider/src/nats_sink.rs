//! NATS publisher for routing decisions and optimization results

use async_nats::Client;
use notification_router::EventSink;
use routing_common::RoutingEvent;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

/// Publishes events on their subject without waiting for the broker
#[derive(Clone)]
pub struct NatsEventSink {
    client: Client,
}

impl NatsEventSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EventSink for NatsEventSink {
    fn publish(&self, event: RoutingEvent) {
        let subject = event.subject();
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize routing event for {}: {}", subject, e);
                return;
            }
        };

        let Ok(handle) = Handle::try_current() else {
            warn!("No async runtime available, dropping event for {}", subject);
            return;
        };

        let client = self.client.clone();
        handle.spawn(async move {
            match client.publish(subject.clone(), payload.into()).await {
                Ok(()) => debug!("Published routing event to {}", subject),
                Err(e) => warn!("Failed to publish routing event to {}: {}", subject, e),
            }
        });
    }
}
