use async_nats::{Client as NatsClient, Message, Subscriber};
use futures::StreamExt;
use notification_router::{DeliveryOptimizer, RoutingEngine, SystemClock};
use routing_common::subjects;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use wasmcloud_provider_sdk::Provider;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::handler::{dispatch_failed_reply, Dispatch, HandlerOutcome, RequestHandler};
use crate::nats_sink::NatsEventSink;
use crate::redis_store::RedisRoutingStore;
use crate::retry::{retry_with_backoff, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Route,
    Optimize,
}

/// Routing provider: serves route and optimize requests over NATS
#[derive(Clone)]
pub struct RoutingProvider {
    nats_client: NatsClient,
    store: RedisRoutingStore,
    handler: RequestHandler,
    permits: Arc<Semaphore>,
}

impl RoutingProvider {
    /// Connect to Redis and NATS and wire the routing engine
    pub async fn from_config(config: ProviderConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        info!("Initializing RoutingProvider");

        let retry = RetryConfig::from_provider_config(&config);

        let store = retry_with_backoff(&retry, || RedisRoutingStore::new(&config.redis_url, config.store_timeout())).await?;
        store.health_check().await?;
        info!("Connected to Redis at {}", config.redis_url);

        let nats_client = retry_with_backoff(&retry, || async {
            async_nats::connect(config.nats_url.as_str())
                .await
                .map_err(ProviderError::nats)
        })
        .await?;
        info!("Connected to NATS at {}", config.nats_url);

        let store_handle = Arc::new(store.clone());
        let engine = Arc::new(RoutingEngine::new(
            store_handle.clone(),
            store_handle.clone(),
            Arc::new(SystemClock),
            Arc::new(NatsEventSink::new(nats_client.clone())),
        ));
        let optimizer = DeliveryOptimizer::new(engine, store_handle.clone(), store_handle);

        info!("RoutingProvider initialized successfully");

        Ok(Self {
            nats_client,
            store,
            handler: RequestHandler::new(Arc::new(optimizer)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
        })
    }

    pub fn store(&self) -> &RedisRoutingStore {
        &self.store
    }

    /// Serve requests until both subscriptions end
    pub async fn run(self) -> Result<(), ProviderError> {
        info!("Starting RoutingProvider");

        let route_subscriber = self.subscribe(subjects::ROUTE_REQUEST).await?;
        let optimize_subscriber = self.subscribe(subjects::OPTIMIZE_REQUEST).await?;

        tokio::join!(
            self.process(route_subscriber, RequestKind::Route),
            self.process(optimize_subscriber, RequestKind::Optimize),
        );

        info!("RoutingProvider subscriptions closed");
        Ok(())
    }

    async fn subscribe(&self, subject: &'static str) -> Result<Subscriber, ProviderError> {
        let subscriber = self
            .nats_client
            .subscribe(subject)
            .await
            .map_err(ProviderError::nats)?;
        info!("Successfully subscribed to {}", subject);
        Ok(subscriber)
    }

    async fn process(&self, mut subscriber: Subscriber, kind: RequestKind) {
        while let Some(message) = subscriber.next().await {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Request limiter closed: {}", e);
                    return;
                }
            };

            let provider = self.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.handle_message(message, kind).await {
                    error!("Error handling {:?} request: {}", kind, e);
                }
                drop(permit);
            });
        }
    }

    async fn handle_message(&self, message: Message, kind: RequestKind) -> Result<(), ProviderError> {
        debug!("Received {:?} request on {}", kind, message.subject);

        let outcome: HandlerOutcome = match kind {
            RequestKind::Route => self.handler.handle_route(&message.payload).await,
            RequestKind::Optimize => self.handler.handle_optimize(&message.payload).await,
        };

        let HandlerOutcome { reply, dispatch } = outcome;
        let dispatched = match dispatch {
            Some(dispatch) => self.publish_dispatch(dispatch).await,
            None => Ok(()),
        };

        let reply = match &dispatched {
            Ok(()) => reply,
            Err(e) => dispatch_failed_reply(e),
        };

        match message.reply {
            Some(subject) => {
                if let Err(e) = self.nats_client.publish(subject, reply.into()).await {
                    error!("Failed to send {:?} reply: {}", kind, e);
                    dispatched?;
                    return Err(ProviderError::nats(e));
                }
            }
            None => warn!("{:?} request on {} had no reply subject", kind, message.subject),
        }

        dispatched
    }

    async fn publish_dispatch(&self, dispatch: Dispatch) -> Result<(), ProviderError> {
        self.nats_client
            .publish(dispatch.subject.clone(), dispatch.payload.into())
            .await
            .map_err(ProviderError::nats)?;
        debug!("Handed off notification to {}", dispatch.subject);
        Ok(())
    }
}

impl Provider for RoutingProvider {}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmcloud_provider_sdk::Provider;

    #[test]
    fn test_provider_traits() {
        fn assert_provider<T: Provider + Clone>() {}
        assert_provider::<RoutingProvider>();
    }
}
