//! [`LogBrokerClient`] over librdkafka, configured from [`KafkaConfig`].
//!
//! Offsets are stored only after the handler succeeds and committed by the
//! client's auto-commit, so a record that crashes its loop is read again by
//! the next member of the group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::transport::{
    ConsumedRecord, LogBrokerClient, LogConsumer, LogProducer, ProducerRecord, RecordHandler,
};
use crate::config::KafkaConfig;
use crate::error::TransportError;

/// Retries of a failing record before the consumer loop gives up.
pub const MAX_RECORD_RETRIES: usize = 5;

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(300);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn kafka_error(err: KafkaError) -> TransportError {
    TransportError::new(err.to_string())
}

/// Run a blocking librdkafka call off the async runtime.
async fn blocking<T, F>(call: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, KafkaError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| TransportError::new(err.to_string()))?
        .map_err(kafka_error)
}

fn security_protocol(config: &KafkaConfig) -> &'static str {
    match (config.ssl, config.sasl.is_some()) {
        (false, false) => "plaintext",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    }
}

/// librdkafka properties shared by producers and consumers.
fn client_settings(config: &KafkaConfig) -> Vec<(&'static str, String)> {
    let mut settings = vec![
        ("bootstrap.servers", config.brokers.join(",")),
        ("client.id", config.client_id.clone()),
        ("security.protocol", security_protocol(config).to_string()),
    ];
    if let Some(sasl) = &config.sasl {
        // librdkafka spells mechanisms in upper case.
        settings.push(("sasl.mechanism", sasl.mechanism.to_ascii_uppercase()));
        settings.push(("sasl.username", sasl.username.clone()));
        settings.push(("sasl.password", sasl.password.clone()));
    }
    settings
}

/// Producers and consumers for one librdkafka configuration.
#[derive(Clone)]
pub struct RdKafkaClient {
    settings: Vec<(&'static str, String)>,
}

impl RdKafkaClient {
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            settings: client_settings(config),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in &self.settings {
            config.set(*key, value.as_str());
        }
        config
    }
}

impl LogBrokerClient for RdKafkaClient {
    fn producer(&self) -> Arc<dyn LogProducer> {
        Arc::new(RdKafkaProducer {
            config: self.client_config(),
            producer: Mutex::new(None),
        })
    }

    fn consumer(&self, group_id: &str) -> Arc<dyn LogConsumer> {
        let mut config = self.client_config();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");
        Arc::new(RdKafkaConsumer {
            config,
            group_id: group_id.to_string(),
            consumer: Mutex::new(None),
            topics: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }
}

struct RdKafkaProducer {
    config: ClientConfig,
    producer: Mutex<Option<FutureProducer>>,
}

impl RdKafkaProducer {
    fn current(&self) -> Result<FutureProducer, TransportError> {
        lock(&self.producer)
            .clone()
            .ok_or_else(|| TransportError::new("producer is not connected"))
    }
}

#[async_trait]
impl LogProducer for RdKafkaProducer {
    async fn connect(&self) -> Result<(), TransportError> {
        let producer: FutureProducer = self.config.create().map_err(kafka_error)?;
        let check = producer.clone();
        blocking(move || check.client().fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())).await?;
        *lock(&self.producer) = Some(producer);
        Ok(())
    }

    async fn send(&self, record: ProducerRecord) -> Result<(), TransportError> {
        let producer = self.current()?;

        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }
        let mut outgoing = FutureRecord::<str, [u8]>::to(&record.topic)
            .payload(record.value.as_slice())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            outgoing = outgoing.key(key);
        }

        let (partition, offset) = producer
            .send(outgoing, SEND_TIMEOUT)
            .await
            .map_err(|(err, _)| kafka_error(err))?;
        debug!(topic = %record.topic, partition, offset, "record delivered");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(producer) = lock(&self.producer).take() else {
            return Ok(());
        };
        blocking(move || producer.flush(FLUSH_TIMEOUT)).await
    }
}

struct RdKafkaConsumer {
    config: ClientConfig,
    group_id: String,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    topics: Mutex<Vec<String>>,
    stopped: AtomicBool,
    stop: Notify,
}

impl RdKafkaConsumer {
    /// `offset_reset` only applies to partitions the group has never committed.
    fn build(&self, offset_reset: &str) -> Result<Arc<StreamConsumer>, TransportError> {
        let mut config = self.config.clone();
        config.set("auto.offset.reset", offset_reset);
        config.create().map(Arc::new).map_err(kafka_error)
    }

    fn current(&self) -> Result<Arc<StreamConsumer>, TransportError> {
        lock(&self.consumer)
            .clone()
            .ok_or_else(|| TransportError::new("consumer is not connected"))
    }
}

async fn handle(handler: &RecordHandler, record: ConsumedRecord) -> Result<(), TransportError> {
    let mut backoff = INITIAL_RETRY_BACKOFF;
    let mut attempt = 0;
    loop {
        let err = match handler(record.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if attempt >= MAX_RECORD_RETRIES {
            return Err(TransportError::new(format!(
                "record {}@{} failed after {} attempts: {}",
                record.topic,
                record.offset,
                attempt + 1,
                err
            )));
        }
        attempt += 1;
        debug!(topic = %record.topic, offset = record.offset, attempt, error = %err, "retrying record");
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
}

fn consumed_record(message: &BorrowedMessage<'_>) -> ConsumedRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    header.value.map(|value| {
                        (
                            header.key.to_string(),
                            String::from_utf8_lossy(value).into_owned(),
                        )
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        value: message.payload().map(<[u8]>::to_vec),
        headers,
    }
}

#[async_trait]
impl LogConsumer for RdKafkaConsumer {
    async fn connect(&self) -> Result<(), TransportError> {
        let consumer = self.build("latest")?;
        let check = Arc::clone(&consumer);
        blocking(move || check.fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())).await?;
        self.stopped.store(false, Ordering::SeqCst);
        *lock(&self.consumer) = Some(consumer);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), TransportError> {
        let mut consumer = self.current()?;

        let check = Arc::clone(&consumer);
        let name = topic.to_string();
        let missing = blocking(move || {
            check
                .fetch_metadata(Some(&name), METADATA_TIMEOUT)
                .map(|metadata| metadata.topics().first().and_then(|t| t.error()))
        })
        .await?;
        if let Some(code) = missing {
            return Err(TransportError::new(RDKafkaErrorCode::from(code).to_string()));
        }

        let mut topics = lock(&self.topics).clone();
        if from_beginning && topics.is_empty() {
            // Nothing is assigned yet, so swapping the client loses nothing.
            consumer = self.build("earliest")?;
            *lock(&self.consumer) = Some(Arc::clone(&consumer));
        }
        topics.push(topic.to_string());

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&names).map_err(kafka_error)?;
        *lock(&self.topics) = topics;
        Ok(())
    }

    async fn run(&self, handler: RecordHandler) -> Result<(), TransportError> {
        let consumer = self.current()?;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let received = tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                message = consumer.recv() => message.map(|message| consumed_record(&message)),
            };
            let record = match received {
                Ok(record) => record,
                Err(err) => {
                    warn!(group_id = %self.group_id, error = %err, "consumer poll failed");
                    continue;
                }
            };

            let (topic, partition, offset) = (record.topic.clone(), record.partition, record.offset);
            handle(&handler, record).await?;
            consumer
                .store_offset(&topic, partition, offset + 1)
                .map_err(kafka_error)?;
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        lock(&self.topics).clear();
        match lock(&self.consumer).take() {
            Some(consumer) => {
                consumer.unsubscribe();
                info!(group_id = %self.group_id, "log consumer closed");
            }
            None => warn!(group_id = %self.group_id, "disconnect on a consumer that is not connected"),
        }
        Ok(())
    }
}
