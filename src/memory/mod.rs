//! In-memory brokers for testing and single-process scenarios.
//!
//! [`MemoryAmqpBroker`] implements [`crate::amqp::AmqpConnection`] and
//! [`MemoryLogBroker`] implements [`crate::kafka::LogBrokerClient`], so the
//! real adapters run unchanged against them. Both carry a [`Faults`] plan
//! for making individual transport calls fail.
//!
//! ```
//! use std::sync::Arc;
//! use broker_bus::kafka::KafkaBroker;
//! use broker_bus::memory::MemoryLogBroker;
//! use broker_bus::topics::TopicRegistry;
//!
//! let cluster = MemoryLogBroker::new();
//! let broker = KafkaBroker::new(Arc::new(cluster.clone()), TopicRegistry::new("backend"));
//! assert_eq!(broker.live_consumers(), 0);
//! ```

mod amqp;
mod faults;
mod log_broker;

pub use amqp::{DeadLetter, MemoryAmqpBroker, PublishedMessage, DEFAULT_MAX_REDELIVERIES};
pub use faults::{Faults, Operation};
pub use log_broker::{MemoryLogBroker, StoredRecord, DEFAULT_MAX_RETRIES};
