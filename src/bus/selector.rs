//! Broker selection: one configuration value, exactly one live adapter.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use super::broker::MessageBroker;
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Supported broker technologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerKind {
    /// Exchange/routing-key/queue broker (RabbitMQ).
    Amqp,
    /// Partitioned-log broker (Kafka).
    Kafka,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Amqp => "rabbitmq",
            BrokerKind::Kafka => "kafka",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = BrokerError;

    /// Case-insensitive and trimmed; empty means the default (AMQP).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "rabbitmq" => Ok(BrokerKind::Amqp),
            "kafka" => Ok(BrokerKind::Kafka),
            _ => Err(BrokerError::UnsupportedBroker(s.to_string())),
        }
    }
}

/// Adapters constructed by the host, at most one per technology.
#[derive(Clone, Default)]
pub struct BrokerAdapters {
    amqp: Option<Arc<dyn MessageBroker>>,
    kafka: Option<Arc<dyn MessageBroker>>,
}

impl BrokerAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_amqp(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.amqp = Some(broker);
        self
    }

    pub fn with_kafka(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.kafka = Some(broker);
        self
    }

    /// Return the adapter for `kind`, failing if it was never constructed.
    pub fn get(&self, kind: BrokerKind) -> Result<Arc<dyn MessageBroker>, BrokerError> {
        let adapter = match kind {
            BrokerKind::Amqp => self.amqp.as_ref(),
            BrokerKind::Kafka => self.kafka.as_ref(),
        };
        adapter.cloned().ok_or(BrokerError::BrokerNotWired(kind))
    }
}

/// Pick the live adapter named by `config.broker`.
///
/// Called once per process; the result is shared by every caller.
pub fn select_broker(
    config: &BrokerConfig,
    adapters: &BrokerAdapters,
) -> Result<Arc<dyn MessageBroker>, BrokerError> {
    let kind = config.kind()?;
    let broker = adapters.get(kind)?;
    info!(broker = %kind, "message broker selected");
    Ok(broker)
}
