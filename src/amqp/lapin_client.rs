//! [`AmqpConnection`] over lapin, configured from [`AmqpConfig`].
//!
//! Publishing goes through one confirm-mode channel. Every subscriber gets
//! its own channel, owned by the task that drains its deliveries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, error, info, warn};

use super::transport::{AmqpBody, AmqpConnection, DeliveryHandler, PublishProperties, QueueBinding};
use crate::config::AmqpConfig;
use crate::error::TransportError;

/// Unacknowledged deliveries a subscriber may hold at once.
pub const PREFETCH: u16 = 10;

const PERSISTENT: u8 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn amqp_error(err: lapin::Error) -> TransportError {
    TransportError::new(err.to_string())
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let basic = BasicProperties::default()
        .with_message_id(properties.message_id.clone().into())
        .with_content_type(properties.content_type.clone().into())
        .with_timestamp(u64::try_from(properties.timestamp).unwrap_or_default());
    if properties.persistent {
        basic.with_delivery_mode(PERSISTENT)
    } else {
        basic
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

struct Session {
    connection: Connection,
    publisher: Channel,
}

/// A lapin connection plus its publishing channel.
pub struct LapinConnection {
    uri: String,
    redacted_uri: String,
    session: Mutex<Option<Arc<Session>>>,
    /// Exchanges declared on the current publishing channel.
    declared: Mutex<HashSet<String>>,
    subscribers: AtomicUsize,
}

impl LapinConnection {
    pub fn new(config: &AmqpConfig) -> Self {
        Self {
            uri: config.connection_uri(),
            redacted_uri: config.redacted_uri(),
            session: Mutex::new(None),
            declared: Mutex::new(HashSet::new()),
            subscribers: AtomicUsize::new(0),
        }
    }

    fn session(&self) -> Result<Arc<Session>, TransportError> {
        lock(&self.session)
            .clone()
            .ok_or_else(|| TransportError::new("amqp connection is not established"))
    }

    async fn declare_exchange(&self, channel: &Channel, exchange: &str) -> Result<(), TransportError> {
        if lock(&self.declared).contains(exchange) {
            return Ok(());
        }
        channel
            .exchange_declare(exchange, ExchangeKind::Topic, durable_exchange(), FieldTable::default())
            .await
            .map_err(amqp_error)?;
        lock(&self.declared).insert(exchange.to_string());
        Ok(())
    }

    /// Close the connection. Subscriber tasks end when their channels close.
    pub async fn close(&self) -> Result<(), TransportError> {
        let Some(session) = lock(&self.session).take() else {
            return Ok(());
        };
        session.connection.close(200, "closing").await.map_err(amqp_error)?;
        info!(uri = %self.redacted_uri, "amqp connection closed");
        Ok(())
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        lock(&self.session).as_ref().is_some_and(|session| {
            session.connection.status().connected() && session.publisher.status().connected()
        })
    }

    async fn init(&self) -> Result<(), TransportError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|err| {
                error!(uri = %self.redacted_uri, error = %err, "amqp connection failed");
                amqp_error(err)
            })?;
        let publisher = connection.create_channel().await.map_err(amqp_error)?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(amqp_error)?;

        lock(&self.declared).clear();
        *lock(&self.session) = Some(Arc::new(Session {
            connection,
            publisher,
        }));
        info!(uri = %self.redacted_uri, "amqp connection established");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<bool, TransportError> {
        let session = self.session()?;
        self.declare_exchange(&session.publisher, exchange).await?;

        let confirmation = session
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                basic_properties(&properties),
            )
            .await
            .map_err(amqp_error)?
            .await
            .map_err(amqp_error)?;
        Ok(confirmation.is_ack())
    }

    async fn create_subscriber(
        &self,
        binding: QueueBinding,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError> {
        let session = self.session()?;
        let channel = session.connection.create_channel().await.map_err(amqp_error)?;

        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(amqp_error)?;
        channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;
        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;
        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;

        let tag = format!(
            "{}-{}",
            binding.queue,
            self.subscribers.fetch_add(1, Ordering::SeqCst)
        );
        let consumer = channel
            .basic_consume(&binding.queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(amqp_error)?;

        info!(queue = %binding.queue, exchange = %binding.exchange, "amqp subscriber started");
        tokio::spawn(drain(binding, channel, consumer, handler));
        Ok(())
    }
}

/// Hand each delivery to `handler`. Ack on success, nack and requeue on error.
async fn drain(binding: QueueBinding, channel: Channel, mut consumer: Consumer, handler: DeliveryHandler) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(queue = %binding.queue, error = %err, "amqp consumer failed");
                break;
            }
        };

        let body = AmqpBody::Text(String::from_utf8_lossy(&delivery.data).into_owned());
        let settled = match handler(body).await {
            Ok(()) => delivery.ack(BasicAckOptions::default()).await,
            Err(err) => {
                warn!(queue = %binding.queue, error = %err, "delivery failed, requeueing");
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        };
        if let Err(err) = settled {
            warn!(queue = %binding.queue, error = %err, "failed to settle delivery");
        }
    }
    debug!(queue = %binding.queue, channel = channel.id(), "amqp consumer stopped");
}
