//! Broker configuration read from environment variables.
//!
//! Every value can be overridden through the environment; nothing is read
//! from files. Use [`BrokerConfig::from_lookup`] to read from something other
//! than the process environment (tests, layered config).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::BrokerKind;
use crate::error::BrokerError;

/// Source of environment-style variables.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Lookup backed by the process environment.
pub fn process_env() -> EnvLookup {
    Arc::new(|key: &str| std::env::var(key).ok())
}

/// Lookup backed by a fixed map.
pub fn map_env<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> EnvLookup
where
    K: Into<String>,
    V: Into<String>,
{
    let vars: HashMap<String, String> = vars
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    Arc::new(move |key: &str| vars.get(key).cloned())
}

pub const BROKER_VAR: &str = "MESSAGE_BROKER";
pub const SERVICE_PREFIX_VAR: &str = "BROKER_SERVICE_PREFIX";
pub const DEFAULT_SERVICE_PREFIX: &str = "backend";

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Raw broker selector value, resolved by [`BrokerConfig::kind`].
    pub broker: String,
    /// Prefix for consumer group ids and queue names.
    pub service_prefix: String,
    pub amqp: AmqpConfig,
    pub kafka: KafkaConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Amqp.as_str().to_string(),
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            amqp: AmqpConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env())
    }

    pub fn from_lookup(env: &EnvLookup) -> Self {
        let service_prefix = non_empty(env(SERVICE_PREFIX_VAR))
            .unwrap_or_else(|| DEFAULT_SERVICE_PREFIX.to_string());

        Self {
            broker: env(BROKER_VAR).unwrap_or_else(|| BrokerKind::Amqp.as_str().to_string()),
            amqp: AmqpConfig::from_lookup(env),
            kafka: KafkaConfig::from_lookup(env, &service_prefix),
            service_prefix,
        }
    }

    /// Resolve the broker selector value.
    pub fn kind(&self) -> Result<BrokerKind, BrokerError> {
        self.broker.parse()
    }
}

/// AMQP connection parameters: a full URI, or host/port/credentials/vhost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub uri: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

impl AmqpConfig {
    pub fn from_lookup(env: &EnvLookup) -> Self {
        let defaults = Self::default();
        Self {
            uri: non_empty(env("RABBITMQ_URL")),
            host: non_empty(env("RABBITMQ_HOST")).unwrap_or(defaults.host),
            port: env("RABBITMQ_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            username: non_empty(env("RABBITMQ_USER")).unwrap_or(defaults.username),
            password: env("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: non_empty(env("RABBITMQ_VHOST")).unwrap_or(defaults.vhost),
        }
    }

    /// The connection URI. An explicit URI wins over the components.
    pub fn connection_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }

    /// The connection URI with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        let uri = self.connection_uri();
        let Some((scheme, rest)) = uri.split_once("://") else {
            return uri;
        };
        let Some((userinfo, host)) = rest.split_once('@') else {
            return uri;
        };
        match userinfo.split_once(':') {
            Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
            None => uri,
        }
    }
}

/// Partitioned-log broker client parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub ssl: bool,
    pub sasl: Option<SaslConfig>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: DEFAULT_SERVICE_PREFIX.to_string(),
            ssl: false,
            sasl: None,
        }
    }
}

/// SASL authentication for the log broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslConfig {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl KafkaConfig {
    pub fn from_lookup(env: &EnvLookup, service_prefix: &str) -> Self {
        let brokers = non_empty(env("KAFKA_BROKERS"))
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| KafkaConfig::default().brokers);

        let sasl = non_empty(env("KAFKA_SASL_MECHANISM")).map(|mechanism| SaslConfig {
            mechanism: mechanism.to_ascii_lowercase(),
            username: env("KAFKA_SASL_USERNAME").unwrap_or_default(),
            password: env("KAFKA_SASL_PASSWORD").unwrap_or_default(),
        });

        Self {
            brokers,
            client_id: non_empty(env("KAFKA_CLIENT_ID"))
                .unwrap_or_else(|| service_prefix.to_string()),
            ssl: env("KAFKA_SSL").map(|v| is_truthy(&v)).unwrap_or(false),
            sasl,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
