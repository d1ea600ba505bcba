//! Logical topics and their physical broker resources.
//!
//! Application code names topics by their logical name. The
//! [`TopicRegistry`] maps each one to the exchange, routing key, queue,
//! log topic and consumer group used by whichever broker is active.
//!
//! One physical name serves as the AMQP exchange, the AMQP routing key and
//! the log-broker topic. It defaults to the logical name and can be
//! overridden per topic with `TOPIC_<LOGICAL_NAME>`:
//!
//! ```text
//! evaluation-results  ──TOPIC_EVALUATION_RESULTS──▶  physical name
//!                                                     ├── exchange / routing key
//!                                                     ├── log topic
//!                                                     └── <prefix>-<physical>  (queue, group id)
//! ```

mod registry;

pub use registry::{
    AmqpConsumeRoute, ConsumeEntry, KafkaRoute, PublishRoute, TopicEntry, TopicRegistry,
};

use std::fmt;
use std::str::FromStr;

use crate::error::BrokerError;

/// Application-level message category, independent of any broker's naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalTopic {
    /// Evaluation jobs, consumed by the external worker.
    EvaluationJobs,
    /// Evaluation results, consumed here.
    EvaluationResults,
    /// Experiment jobs, consumed by the external worker.
    ExperimentJobs,
    /// Experiment results, consumed here.
    ExperimentResults,
}

impl LogicalTopic {
    pub const ALL: [LogicalTopic; 4] = [
        LogicalTopic::EvaluationJobs,
        LogicalTopic::EvaluationResults,
        LogicalTopic::ExperimentJobs,
        LogicalTopic::ExperimentResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalTopic::EvaluationJobs => "evaluation-jobs",
            LogicalTopic::EvaluationResults => "evaluation-results",
            LogicalTopic::ExperimentJobs => "experiment-jobs",
            LogicalTopic::ExperimentResults => "experiment-results",
        }
    }

    /// Environment variable overriding this topic's physical name.
    pub fn env_var(&self) -> String {
        format!(
            "TOPIC_{}",
            self.as_str().replace('-', "_").to_ascii_uppercase()
        )
    }
}

impl fmt::Display for LogicalTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalTopic {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogicalTopic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| BrokerError::UnknownTopic(s.to_string()))
    }
}

impl AsRef<str> for LogicalTopic {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
