//! The broker trait shared by every adapter.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use super::handler::MessageHandler;
use super::selector::BrokerKind;
use crate::error::BrokerError;

/// Per-publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Message id. AMQP falls back to `<topic>-<timestamp>`; the log broker
    /// sends it as a header and uses it as the key when no key is given.
    pub message_id: Option<String>,
    /// Partition key (log broker only).
    pub key: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Publish/subscribe facade implemented by each broker adapter.
///
/// ## Lifecycle
///
/// 1. `subscribe` any number of times (records intent, no network)
/// 2. `bootstrap` once, after wiring completes
/// 3. `publish` at any time; the first call connects lazily
/// 4. `shutdown` at teardown
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Which technology this adapter talks to.
    fn kind(&self) -> BrokerKind;

    /// Publish a JSON message to a logical topic.
    async fn publish(
        &self,
        topic: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Register a handler for a logical topic. Takes effect at `bootstrap`.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError>;

    /// Start consumers for every pending subscription.
    async fn bootstrap(&self) -> Result<(), BrokerError>;

    /// Release producer and consumer resources.
    async fn shutdown(&self) -> Result<(), BrokerError>;

    /// Number of subscriptions waiting for `bootstrap`.
    fn pending_subscriptions(&self) -> usize;
}

/// Publish any serializable value.
pub trait PublishExt: MessageBroker {
    /// Serialize `message` to JSON and publish it.
    ///
    /// Serialization runs before anything is sent; a failure surfaces as
    /// [`BrokerError::Serialization`].
    fn publish_json<'a, T>(
        &'a self,
        topic: &'a str,
        message: &T,
        options: PublishOptions,
    ) -> BoxFuture<'a, Result<(), BrokerError>>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(message) {
            Ok(value) => Box::pin(async move { self.publish(topic, &value, options).await }),
            Err(err) => Box::pin(async move { Err(BrokerError::Serialization(err)) }),
        }
    }
}

impl<B: MessageBroker + ?Sized> PublishExt for B {}
