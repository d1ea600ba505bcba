//! The partitioned-log client seam.
//!
//! The `rdkafka` feature provides `RdKafkaClient`, built from
//! [`crate::KafkaConfig`]. [`crate::memory::MemoryLogBroker`] is the
//! in-process implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{DeliveryError, TransportError};

/// A record to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// A record delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// `None` for tombstones.
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
}

impl ConsumedRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Callback run per record. `Err` asks the consumer to retry the record.
pub type RecordHandler =
    Arc<dyn Fn(ConsumedRecord) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// Factory for producers and consumers sharing one client configuration.
pub trait LogBrokerClient: Send + Sync {
    /// A new, unconnected producer.
    fn producer(&self) -> Arc<dyn LogProducer>;

    /// A new, unconnected consumer in `group_id`.
    fn consumer(&self, group_id: &str) -> Arc<dyn LogConsumer>;
}

#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn send(&self, record: ProducerRecord) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Join `topic`. With `from_beginning == false` a new group starts at the log end.
    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), TransportError>;

    /// Run the consumption loop.
    ///
    /// Resolves `Ok(())` once the consumer is disconnected, `Err` if the loop
    /// crashed (for example, a record kept failing after every retry).
    async fn run(&self, handler: RecordHandler) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
