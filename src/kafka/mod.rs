//! Partitioned-log adapter: topic/consumer-group brokers (Kafka).
//!
//! One producer is shared by every publish and created on first use. Each
//! subscription gets its own consumer in the `<prefix>-<topic>` group.
//!
//! ```text
//! bootstrap():   for each pending subscription, in order
//!                  consumer(group) → connect → subscribe(topic) → live list → spawn run()
//!                any connect/subscribe failure:
//!                  disconnect everything started in this pass (best effort),
//!                  clear it from the live list, return the original error
//!
//! run() task:    detached; a crash is reported to the crash log task, never
//!                to bootstrap and never triggers rollback
//! ```

mod broker;
#[cfg(feature = "rdkafka")]
mod rdkafka_client;
mod transport;

pub use broker::{ConsumerCrash, KafkaBroker, MAX_RECORDED_CRASHES};
#[cfg(feature = "rdkafka")]
pub use rdkafka_client::{RdKafkaClient, MAX_RECORD_RETRIES};
pub use transport::{
    ConsumedRecord, LogBrokerClient, LogConsumer, LogProducer, ProducerRecord, RecordHandler,
};

/// Header carrying the caller's message id.
pub const MESSAGE_ID_HEADER: &str = "message-id";
