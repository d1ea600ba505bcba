//! `AmqpBroker`: [`MessageBroker`] over an [`AmqpConnection`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::transport::{AmqpBody, AmqpConnection, DeliveryHandler, PublishProperties, QueueBinding};
use crate::bus::{BrokerKind, MessageBroker, MessageHandler, PendingSubscriptions, PublishOptions};
use crate::error::{BrokerError, DeliveryError};
use crate::topics::TopicRegistry;

#[derive(Clone)]
struct AmqpSubscription {
    topic: String,
    handler: MessageHandler,
}

/// AMQP implementation of the broker facade.
///
/// Bootstrap activates subscribers one at a time in registration order. If
/// one fails, bootstrap stops and returns the error; subscribers already
/// started stay attached. They are cheap to leave running and do not get in
/// the way of a restart.
///
/// The adapter owns no consumers of its own, so `shutdown` has nothing to
/// release: the connection and its channels are closed by the client.
pub struct AmqpBroker {
    connection: Arc<dyn AmqpConnection>,
    registry: TopicRegistry,
    pending: PendingSubscriptions<AmqpSubscription>,
}

impl AmqpBroker {
    pub fn new(connection: Arc<dyn AmqpConnection>, registry: TopicRegistry) -> Self {
        Self {
            connection,
            registry,
            pending: PendingSubscriptions::new(),
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    async fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connection.is_connected() {
            return Ok(());
        }
        info!("AMQP connection is down, initialising");
        self.connection.init().await.map_err(|err| {
            error!(error = %err, "AMQP connection init failed");
            BrokerError::Connection(err)
        })
    }

    fn binding(&self, topic: &str) -> Result<QueueBinding, BrokerError> {
        let route = self
            .registry
            .consume_route(topic)?
            .ok_or_else(|| BrokerError::NoConsumeRoute(topic.to_string()))?;
        let queue = route
            .queue
            .ok_or_else(|| BrokerError::MissingQueue(topic.to_string()))?;
        Ok(QueueBinding {
            exchange: route.exchange,
            routing_key: route.routing_key,
            queue,
        })
    }
}

/// Decode text bodies to JSON before calling the application handler.
fn delivery_handler(topic: String, handler: MessageHandler) -> DeliveryHandler {
    Arc::new(move |body: AmqpBody| {
        let topic = topic.clone();
        let handler = Arc::clone(&handler);
        async move {
            let payload = match body {
                AmqpBody::Json(value) => value,
                AmqpBody::Text(raw) => match serde_json::from_str(&raw) {
                    Ok(value) => value,
                    Err(source) => {
                        error!(topic = %topic, raw = %raw, error = %source, "failed to parse AMQP message");
                        return Err(DeliveryError::Decode { topic, raw, source });
                    }
                },
            };
            handler(payload).await.map_err(DeliveryError::Handler)
        }
        .boxed()
    })
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Amqp
    }

    async fn publish(
        &self,
        topic: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if message.is_null() {
            return Err(BrokerError::EmptyMessage(topic.to_string()));
        }
        let route = self.registry.publish_route(topic)?;
        let body = serde_json::to_vec(message).map_err(BrokerError::Serialization)?;

        self.ensure_connected().await?;

        let now = Utc::now().timestamp_millis();
        let message_id = options
            .message_id
            .unwrap_or_else(|| format!("{}-{}", topic, now));
        let properties = PublishProperties {
            message_id: message_id.clone(),
            persistent: true,
            content_type: "application/json".to_string(),
            timestamp: now,
        };

        let confirmed = self
            .connection
            .publish(&route.exchange, &route.routing_key, body, properties)
            .await
            .map_err(BrokerError::Transport)?;

        if !confirmed {
            warn!(exchange = %route.exchange, message_id = %message_id, "publish not confirmed");
            return Err(BrokerError::NotConfirmed {
                exchange: route.exchange,
                routing_key: route.routing_key,
                message_id,
            });
        }

        debug!(exchange = %route.exchange, routing_key = %route.routing_key, message_id = %message_id, "published");
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        let binding = self.binding(topic)?;
        debug!(topic, queue = %binding.queue, "AMQP subscription registered");
        self.pending.push(AmqpSubscription {
            topic: topic.to_string(),
            handler,
        });
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), BrokerError> {
        let pending = self.pending.snapshot();
        if pending.is_empty() {
            return Ok(());
        }
        self.ensure_connected().await?;

        for subscription in &pending {
            let binding = self.binding(&subscription.topic)?;
            let queue = binding.queue.clone();
            let handler = delivery_handler(subscription.topic.clone(), Arc::clone(&subscription.handler));

            if let Err(err) = self.connection.create_subscriber(binding, handler).await {
                error!(topic = %subscription.topic, queue = %queue, error = %err, "failed to start AMQP subscriber");
                return Err(BrokerError::Transport(err));
            }
            info!(topic = %subscription.topic, queue = %queue, "AMQP subscriber started");
        }

        self.pending.drain_front(pending.len());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        debug!("AMQP adapter shutdown: connection teardown is left to the client");
        Ok(())
    }

    fn pending_subscriptions(&self) -> usize {
        self.pending.len()
    }
}
