//! Error types for the broker layer.
//!
//! Errors fall into the categories callers need to tell apart:
//!
//! - configuration (unknown topic, missing route, unsupported broker): never retryable
//! - connectivity (`Connection`): retryable by the caller or a process restart
//! - payload (`EmptyMessage`, `Serialization`, [`DeliveryError::Decode`])
//! - confirmation (`NotConfirmed`): sent, but the broker never acknowledged it
//! - shutdown ([`ShutdownError`]): every resource that failed to close

use std::fmt;

use thiserror::Error;

use crate::bus::BrokerKind;

/// Boxed error returned by application message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error reported by an underlying transport client.
///
/// The message is kept verbatim so callers see exactly what the client said
/// (`Connection refused`, `Topic does not exist`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The logical topic is not registered in the topic registry.
    #[error("unknown logical topic: {0}")]
    UnknownTopic(String),

    /// The topic is publish-only; this service does not consume it.
    #[error("no consume route for topic: {0}")]
    NoConsumeRoute(String),

    /// The consume route has no queue name.
    #[error("consume route for topic {0} has no queue")]
    MissingQueue(String),

    /// The consume route has no consumer group id.
    #[error("consume route for topic {0} has no consumer group id")]
    MissingGroupId(String),

    /// The configured broker technology is not one we know.
    #[error("unsupported message broker: {0:?} (expected \"rabbitmq\" or \"kafka\")")]
    UnsupportedBroker(String),

    /// The configured broker technology has no adapter wired in.
    #[error("message broker {0} is configured but no adapter was constructed for it")]
    BrokerNotWired(BrokerKind),

    /// `publish` was called with a null message.
    #[error("cannot publish an empty message to topic {0}")]
    EmptyMessage(String),

    /// The message could not be encoded to bytes.
    #[error("failed to serialize message: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Connecting (or re-initialising a connection) failed.
    #[error(transparent)]
    Connection(TransportError),

    /// The transport failed to send, subscribe or start a consumer.
    #[error(transparent)]
    Transport(TransportError),

    /// The message was handed to the broker but it never confirmed receipt.
    #[error("publish to {exchange} ({routing_key}) was not confirmed for message {message_id}")]
    NotConfirmed {
        exchange: String,
        routing_key: String,
        message_id: String,
    },

    /// One or more resources failed to close during shutdown.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl BrokerError {
    /// Whether retrying the same call (or restarting the process) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Transport(_)
                | BrokerError::NotConfirmed { .. }
        )
    }

    /// Whether this is a configuration error, surfaced before any network call.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BrokerError::UnknownTopic(_)
                | BrokerError::NoConsumeRoute(_)
                | BrokerError::MissingQueue(_)
                | BrokerError::MissingGroupId(_)
                | BrokerError::UnsupportedBroker(_)
                | BrokerError::BrokerNotWired(_)
        )
    }
}

/// Per-message failure handed back to the consuming transport.
///
/// Any `Err` tells the transport to redeliver (nack/requeue for AMQP, retry
/// for the log broker).
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The payload could not be parsed as JSON.
    #[error("failed to parse message on {topic}: {source}")]
    Decode {
        topic: String,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The application handler failed.
    #[error(transparent)]
    Handler(HandlerError),
}

/// A resource that is closed on shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResource {
    Producer,
    Consumer { topic: String, group_id: String },
}

impl fmt::Display for ShutdownResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownResource::Producer => write!(f, "producer"),
            ShutdownResource::Consumer { topic, group_id } => {
                write!(f, "consumer {} (group {})", topic, group_id)
            }
        }
    }
}

/// A single failed disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownFailure {
    pub resource: ShutdownResource,
    pub error: TransportError,
}

/// Aggregate of every disconnect that failed during one shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownError {
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownError {
    pub fn push(&mut self, resource: ShutdownResource, error: TransportError) {
        self.failures.push(ShutdownFailure { resource, error });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` when nothing failed, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ShutdownError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown failed with {} error(s)", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, failure.resource, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}
