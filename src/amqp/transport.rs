//! The AMQP client seam.
//!
//! The `lapin` feature provides `LapinConnection`, built from
//! [`crate::AmqpConfig`]. [`crate::memory::MemoryAmqpBroker`] is the
//! in-process implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{DeliveryError, TransportError};

/// Properties attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub message_id: String,
    /// Delivery mode 2.
    pub persistent: bool,
    pub content_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Queue bound to an exchange by routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

/// Message body as handed over by the client.
///
/// Some clients decode JSON bodies themselves; others pass the raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpBody {
    Text(String),
    Json(Value),
}

/// Callback the client invokes per delivery. `Err` means nack and requeue.
pub type DeliveryHandler =
    Arc<dyn Fn(AmqpBody) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// A managed connection to an AMQP broker.
///
/// The connection is shared by publishing and consuming; reconnects are the
/// client's business, `init` only forces one.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Whether the underlying connection is currently up.
    fn is_connected(&self) -> bool;

    /// (Re)establish the connection.
    async fn init(&self) -> Result<(), TransportError>;

    /// Publish with publisher confirms enabled.
    ///
    /// `Ok(false)` means the broker received the message but did not confirm it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<bool, TransportError>;

    /// Declare and bind `binding.queue`, then start delivering to `handler`.
    async fn create_subscriber(
        &self,
        binding: QueueBinding,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError>;
}
