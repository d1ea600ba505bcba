//! broker_bus: one publish/subscribe facade over an AMQP broker and a
//! partitioned-log broker.
//!
//! - [`topics`]: logical topic names and their physical routes
//! - [`bus`]: the [`MessageBroker`] trait and broker selection
//! - [`amqp`] / [`kafka`]: the two adapters and their client seams
//! - [`lifecycle`]: host-driven bootstrap and shutdown
//! - [`memory`]: in-process brokers for tests and local runs

pub mod amqp;
pub mod bus;
pub mod kafka;
pub mod lifecycle;
#[cfg(feature = "memory")]
pub mod memory;
pub mod topics;

mod config;
mod error;

pub use amqp::AmqpBroker;
pub use bus::{
    handler, select_broker, typed_handler, BrokerAdapters, BrokerKind, MessageBroker,
    MessageHandler, PublishExt, PublishOptions,
};
pub use config::{
    map_env, process_env, AmqpConfig, BrokerConfig, EnvLookup, KafkaConfig, SaslConfig,
};
pub use error::{
    BrokerError, DeliveryError, HandlerError, ShutdownError, ShutdownFailure, ShutdownResource,
    TransportError,
};
pub use kafka::KafkaBroker;
pub use lifecycle::BrokerRuntime;
pub use topics::{LogicalTopic, TopicRegistry};
