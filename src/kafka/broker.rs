//! `KafkaBroker`: [`MessageBroker`] over a [`LogBrokerClient`].

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::transport::{
    ConsumedRecord, LogBrokerClient, LogConsumer, LogProducer, ProducerRecord, RecordHandler,
};
use super::MESSAGE_ID_HEADER;
use crate::bus::{BrokerKind, MessageBroker, MessageHandler, PendingSubscriptions, PublishOptions};
use crate::error::{BrokerError, DeliveryError, ShutdownError, ShutdownResource, TransportError};
use crate::topics::TopicRegistry;

/// Crashes kept for inspection. Older ones are only counted.
pub const MAX_RECORDED_CRASHES: usize = 64;

/// One producer connect, awaited by every publish that arrives while it runs.
type ProducerConnect = Shared<BoxFuture<'static, Result<Arc<dyn LogProducer>, TransportError>>>;

#[derive(Clone)]
struct KafkaSubscription {
    topic: String,
    physical_topic: String,
    group_id: String,
    handler: MessageHandler,
}

struct LiveConsumer {
    topic: String,
    group_id: String,
    consumer: Arc<dyn LogConsumer>,
}

/// A consumption loop that ended with an error after bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerCrash {
    pub topic: String,
    pub group_id: String,
    pub error: String,
}

/// Most recent crashes plus a running total.
#[derive(Debug, Default)]
struct CrashLog {
    recent: VecDeque<ConsumerCrash>,
    total: usize,
}

impl CrashLog {
    fn record(&mut self, crash: ConsumerCrash) {
        if self.recent.len() == MAX_RECORDED_CRASHES {
            self.recent.pop_front();
        }
        self.recent.push_back(crash);
        self.total += 1;
    }
}

/// Partitioned-log implementation of the broker facade.
pub struct KafkaBroker {
    client: Arc<dyn LogBrokerClient>,
    registry: TopicRegistry,
    /// The shared producer's connect. Cleared when that connect fails so the
    /// next publish starts a fresh one.
    producer: Mutex<Option<ProducerConnect>>,
    pending: PendingSubscriptions<KafkaSubscription>,
    consumers: Mutex<Vec<LiveConsumer>>,
    crash_tx: mpsc::UnboundedSender<ConsumerCrash>,
    crash_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumerCrash>>>,
    crashes: Arc<Mutex<CrashLog>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KafkaBroker {
    pub fn new(client: Arc<dyn LogBrokerClient>, registry: TopicRegistry) -> Self {
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        Self {
            client,
            registry,
            producer: Mutex::new(None),
            pending: PendingSubscriptions::new(),
            consumers: Mutex::new(Vec::new()),
            crash_tx,
            crash_rx: Mutex::new(Some(crash_rx)),
            crashes: Arc::new(Mutex::new(CrashLog::default())),
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Number of consumers started by bootstrap and not yet disconnected.
    pub fn live_consumers(&self) -> usize {
        lock(&self.consumers).len()
    }

    /// The last [`MAX_RECORDED_CRASHES`] crashes, oldest first.
    pub fn crashes(&self) -> Vec<ConsumerCrash> {
        lock(&self.crashes).recent.iter().cloned().collect()
    }

    /// Crashes logged since construction, including those no longer kept.
    pub fn crash_count(&self) -> usize {
        lock(&self.crashes).total
    }

    /// Whether a connected producer is currently held.
    pub fn has_producer(&self) -> bool {
        lock(&self.producer)
            .as_ref()
            .and_then(|connect| connect.peek())
            .is_some_and(Result::is_ok)
    }

    async fn producer(&self) -> Result<Arc<dyn LogProducer>, BrokerError> {
        let connect = {
            let mut slot = lock(&self.producer);
            match slot.as_ref() {
                Some(connect) => connect.clone(),
                None => {
                    let connect = connect_producer(self.client.producer());
                    *slot = Some(connect.clone());
                    connect
                }
            }
        };

        match connect.clone().await {
            Ok(producer) => Ok(producer),
            Err(err) => {
                let mut slot = lock(&self.producer);
                if slot.as_ref().is_some_and(|current| current.ptr_eq(&connect)) {
                    error!(error = %err, "log producer failed to connect");
                    *slot = None;
                }
                Err(BrokerError::Connection(err))
            }
        }
    }

    /// Spawn the task that drains crash reports into the log.
    fn start_crash_logger(&self) {
        let Some(mut rx) = lock(&self.crash_rx).take() else {
            return;
        };
        let crashes = Arc::clone(&self.crashes);
        tokio::spawn(async move {
            while let Some(crash) = rx.recv().await {
                error!(
                    topic = %crash.topic,
                    group_id = %crash.group_id,
                    error = %crash.error,
                    "consumer crashed"
                );
                lock(&crashes).record(crash);
            }
        });
    }

    async fn start_consumer(&self, subscription: &KafkaSubscription) -> Result<(), BrokerError> {
        let consumer = self.client.consumer(&subscription.group_id);
        consumer.connect().await.map_err(BrokerError::Connection)?;

        if let Err(err) = consumer.subscribe(&subscription.physical_topic, false).await {
            if let Err(disconnect_err) = consumer.disconnect().await {
                warn!(
                    topic = %subscription.physical_topic,
                    error = %disconnect_err,
                    "failed to disconnect consumer whose subscribe failed"
                );
            }
            return Err(BrokerError::Transport(err));
        }

        lock(&self.consumers).push(LiveConsumer {
            topic: subscription.physical_topic.clone(),
            group_id: subscription.group_id.clone(),
            consumer: Arc::clone(&consumer),
        });

        self.spawn_consumption(subscription, consumer);
        info!(
            topic = %subscription.physical_topic,
            group_id = %subscription.group_id,
            "log consumer started"
        );
        Ok(())
    }

    /// Run the consumption loop on its own task. Its outcome only ever
    /// reaches the crash log.
    fn spawn_consumption(&self, subscription: &KafkaSubscription, consumer: Arc<dyn LogConsumer>) {
        let handler = record_handler(
            subscription.physical_topic.clone(),
            Arc::clone(&subscription.handler),
        );
        let topic = subscription.physical_topic.clone();
        let group_id = subscription.group_id.clone();
        let crash_tx = self.crash_tx.clone();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(consumer.run(handler)).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => {
                    debug!(topic = %topic, "consumer loop stopped");
                    return;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => "consumer loop panicked".to_string(),
            };
            let _ = crash_tx.send(ConsumerCrash {
                topic,
                group_id,
                error,
            });
        });
    }

    /// Disconnect every consumer started at or after `started_from` and drop
    /// them from the live list. Disconnect failures are logged, not returned.
    async fn rollback(&self, started_from: usize) {
        let started: Vec<LiveConsumer> = {
            let mut live = lock(&self.consumers);
            let from = started_from.min(live.len());
            live.drain(from..).collect()
        };
        warn!(consumers = started.len(), "bootstrap failed, rolling back started consumers");

        for live in started {
            if let Err(err) = live.consumer.disconnect().await {
                error!(
                    topic = %live.topic,
                    group_id = %live.group_id,
                    error = %err,
                    "failed to disconnect consumer during rollback"
                );
            }
        }
    }
}

fn connect_producer(producer: Arc<dyn LogProducer>) -> ProducerConnect {
    async move {
        producer.connect().await?;
        info!("log producer connected");
        Ok::<_, TransportError>(producer)
    }
    .boxed()
    .shared()
}

/// Decode record values to JSON before calling the application handler.
///
/// Empty values are skipped with a warning.
fn record_handler(topic: String, handler: MessageHandler) -> RecordHandler {
    Arc::new(move |record: ConsumedRecord| {
        let topic = topic.clone();
        let handler = Arc::clone(&handler);
        async move {
            let value = match record.value {
                Some(value) if !value.is_empty() => value,
                _ => {
                    warn!(topic = %topic, offset = record.offset, "skipping empty message");
                    return Ok(());
                }
            };
            let payload: Value = match serde_json::from_slice(&value) {
                Ok(payload) => payload,
                Err(source) => {
                    let raw = String::from_utf8_lossy(&value).into_owned();
                    error!(topic = %topic, offset = record.offset, raw = %raw, error = %source, "failed to parse message");
                    return Err(DeliveryError::Decode { topic, raw, source });
                }
            };
            handler(payload).await.map_err(DeliveryError::Handler)
        }
        .boxed()
    })
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    async fn publish(
        &self,
        topic: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if message.is_null() {
            return Err(BrokerError::EmptyMessage(topic.to_string()));
        }
        let physical_topic = self.registry.kafka_topic(topic)?;
        let value = serde_json::to_vec(message).map_err(BrokerError::Serialization)?;

        let producer = self.producer().await?;

        let mut headers = Vec::new();
        if let Some(id) = &options.message_id {
            headers.push((MESSAGE_ID_HEADER.to_string(), id.clone()));
        }
        let record = ProducerRecord {
            topic: physical_topic.clone(),
            key: options.key.or(options.message_id),
            value,
            headers,
        };

        producer.send(record).await.map_err(BrokerError::Transport)?;
        debug!(topic = %physical_topic, "published");
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        let route = self
            .registry
            .kafka_route(topic)?
            .ok_or_else(|| BrokerError::NoConsumeRoute(topic.to_string()))?;
        let group_id = route
            .group_id
            .ok_or_else(|| BrokerError::MissingGroupId(topic.to_string()))?;

        debug!(topic, group_id = %group_id, "log subscription registered");
        self.pending.push(KafkaSubscription {
            topic: topic.to_string(),
            physical_topic: route.topic,
            group_id,
            handler,
        });
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), BrokerError> {
        let pending = self.pending.snapshot();
        if pending.is_empty() {
            return Ok(());
        }
        self.start_crash_logger();

        let started_from = self.live_consumers();
        for subscription in &pending {
            if let Err(err) = self.start_consumer(subscription).await {
                error!(topic = %subscription.topic, error = %err, "failed to start log consumer");
                self.rollback(started_from).await;
                return Err(err);
            }
        }

        self.pending.drain_front(pending.len());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        let mut failures = ShutdownError::default();

        let connect = lock(&self.producer).take();
        if let Some(connect) = connect {
            // A connect that never succeeded holds nothing to release.
            if let Ok(producer) = connect.clone().await {
                match producer.disconnect().await {
                    Ok(()) => info!("log producer disconnected"),
                    Err(err) => {
                        failures.push(ShutdownResource::Producer, err);
                        lock(&self.producer).get_or_insert(connect);
                    }
                }
            }
        }

        let consumers = std::mem::take(&mut *lock(&self.consumers));
        let mut still_live = Vec::new();
        for live in consumers {
            match live.consumer.disconnect().await {
                Ok(()) => debug!(topic = %live.topic, group_id = %live.group_id, "log consumer disconnected"),
                Err(err) => {
                    failures.push(
                        ShutdownResource::Consumer {
                            topic: live.topic.clone(),
                            group_id: live.group_id.clone(),
                        },
                        err,
                    );
                    still_live.push(live);
                }
            }
        }
        lock(&self.consumers).extend(still_live);

        failures.into_result().map_err(BrokerError::Shutdown)
    }

    fn pending_subscriptions(&self) -> usize {
        self.pending.len()
    }
}
