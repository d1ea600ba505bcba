//! Topic registry: logical topic to publish/consume routes.

use crate::config::{process_env, BrokerConfig, EnvLookup, DEFAULT_SERVICE_PREFIX};
use crate::error::BrokerError;

use super::LogicalTopic;

/// Where a message for a topic is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRoute {
    pub exchange: String,
    pub routing_key: String,
}

/// Where an AMQP consumer for a topic binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConsumeRoute {
    pub exchange: String,
    pub routing_key: String,
    pub queue: Option<String>,
}

/// Log-broker topic and consumer group for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRoute {
    pub topic: String,
    pub group_id: Option<String>,
}

/// Consume side of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeEntry {
    /// Whether AMQP consumers get a queue.
    pub queue: bool,
    /// Whether log consumers get a group id.
    pub group: bool,
}

impl ConsumeEntry {
    pub const FULL: ConsumeEntry = ConsumeEntry {
        queue: true,
        group: true,
    };
}

/// A registered topic. `consume: None` means publish-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicEntry {
    pub topic: LogicalTopic,
    pub consume: Option<ConsumeEntry>,
}

impl TopicEntry {
    pub fn publish_only(topic: LogicalTopic) -> Self {
        Self {
            topic,
            consume: None,
        }
    }

    pub fn consumed(topic: LogicalTopic) -> Self {
        Self {
            topic,
            consume: Some(ConsumeEntry::FULL),
        }
    }
}

/// Resolves logical topics to physical broker resources.
///
/// Physical names are recomputed on every call; environment changes take
/// effect on the next lookup.
#[derive(Clone)]
pub struct TopicRegistry {
    service_prefix: String,
    entries: Vec<TopicEntry>,
    env: EnvLookup,
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("service_prefix", &self.service_prefix)
            .field("entries", &self.entries)
            .finish()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_PREFIX)
    }
}

impl TopicRegistry {
    /// Registry with the default table: jobs are publish-only, results are
    /// consumed by this service.
    pub fn new(service_prefix: impl Into<String>) -> Self {
        Self::empty(service_prefix)
            .with_entry(TopicEntry::publish_only(LogicalTopic::EvaluationJobs))
            .with_entry(TopicEntry::consumed(LogicalTopic::EvaluationResults))
            .with_entry(TopicEntry::publish_only(LogicalTopic::ExperimentJobs))
            .with_entry(TopicEntry::consumed(LogicalTopic::ExperimentResults))
    }

    /// Registry with no topics.
    pub fn empty(service_prefix: impl Into<String>) -> Self {
        Self {
            service_prefix: service_prefix.into(),
            entries: Vec::new(),
            env: process_env(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.service_prefix.clone())
    }

    /// Register (or replace) an entry.
    pub fn with_entry(mut self, entry: TopicEntry) -> Self {
        self.entries.retain(|e| e.topic != entry.topic);
        self.entries.push(entry);
        self
    }

    /// Read physical-name overrides from `env` instead of the process environment.
    pub fn with_lookup(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    pub fn service_prefix(&self) -> &str {
        &self.service_prefix
    }

    pub fn entries(&self) -> &[TopicEntry] {
        &self.entries
    }

    /// Physical name for a topic: `TOPIC_<NAME>` if set, else the logical name.
    pub fn physical_name(&self, topic: LogicalTopic) -> String {
        (self.env)(&topic.env_var())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| topic.as_str().to_string())
    }

    /// Consumer group id (and AMQP queue name): `<prefix>-<physical>`.
    pub fn group_id(&self, topic: LogicalTopic) -> String {
        format!("{}-{}", self.service_prefix, self.physical_name(topic))
    }

    fn entry(&self, topic: &str) -> Result<TopicEntry, BrokerError> {
        let logical: LogicalTopic = topic.parse()?;
        self.entries
            .iter()
            .find(|e| e.topic == logical)
            .copied()
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    pub fn publish_route(&self, topic: &str) -> Result<PublishRoute, BrokerError> {
        let entry = self.entry(topic)?;
        let name = self.physical_name(entry.topic);
        Ok(PublishRoute {
            exchange: name.clone(),
            routing_key: name,
        })
    }

    /// AMQP consume route, or `None` for publish-only topics.
    pub fn consume_route(&self, topic: &str) -> Result<Option<AmqpConsumeRoute>, BrokerError> {
        let entry = self.entry(topic)?;
        Ok(entry.consume.map(|consume| {
            let name = self.physical_name(entry.topic);
            AmqpConsumeRoute {
                exchange: name.clone(),
                routing_key: name,
                queue: consume.queue.then(|| self.group_id(entry.topic)),
            }
        }))
    }

    /// Physical log topic a message is produced to.
    pub fn kafka_topic(&self, topic: &str) -> Result<String, BrokerError> {
        let entry = self.entry(topic)?;
        Ok(self.physical_name(entry.topic))
    }

    /// Log topic and group id for consuming, or `None` for publish-only topics.
    pub fn kafka_route(&self, topic: &str) -> Result<Option<KafkaRoute>, BrokerError> {
        let entry = self.entry(topic)?;
        Ok(entry.consume.map(|consume| KafkaRoute {
            topic: self.physical_name(entry.topic),
            group_id: consume.group.then(|| self.group_id(entry.topic)),
        }))
    }
}
