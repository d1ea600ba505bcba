//! AMQP adapter: exchange/routing-key/queue brokers with publisher confirms.
//!
//! ## Usage
//!
//! ```ignore
//! let broker = AmqpBroker::new(connection, TopicRegistry::from_config(&config));
//!
//! broker.subscribe("evaluation-results", handler(|payload| async move {
//!     record_result(payload).await
//! }))?;
//! broker.bootstrap().await?;
//!
//! broker.publish("evaluation-jobs", &json!({ "run_id": "r-1" }), PublishOptions::new()).await?;
//! ```

mod broker;
#[cfg(feature = "lapin")]
mod lapin_client;
mod transport;

pub use broker::AmqpBroker;
#[cfg(feature = "lapin")]
pub use lapin_client::{LapinConnection, PREFETCH};
pub use transport::{AmqpBody, AmqpConnection, DeliveryHandler, PublishProperties, QueueBinding};
