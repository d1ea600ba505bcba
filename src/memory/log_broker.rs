//! In-process partitioned-log broker (single partition per topic).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::faults::{Faults, Operation};
use crate::error::TransportError;
use crate::kafka::{
    ConsumedRecord, LogBrokerClient, LogConsumer, LogProducer, ProducerRecord, RecordHandler,
};

/// Default retries of a failing record before the consumer loop crashes.
pub const DEFAULT_MAX_RETRIES: usize = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A record stored in a topic log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: Option<String>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
}

#[derive(Default)]
struct Logs {
    topics: HashMap<String, Vec<StoredRecord>>,
    /// Next offset to hand out, per (group, topic).
    offsets: HashMap<(String, String), usize>,
}

struct State {
    faults: Faults,
    auto_create_topics: AtomicBool,
    max_retries: AtomicUsize,
    retry_backoff: Mutex<Duration>,
    logs: Mutex<Logs>,
    appended: Notify,
    connected_producers: AtomicUsize,
    connected_consumers: AtomicUsize,
    failed_records: Mutex<Vec<ConsumedRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process log broker for tests and single-process setups.
///
/// - topics are append-only logs with one partition
/// - each consumer group has one offset per topic; members of a group compete
/// - a new group starts at the log end unless subscribed `from_beginning`
/// - a failing record is retried `max_retries` times, then the consumer
///   loop returns `Err` (crash) and the record is kept in `failed_records`
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct MemoryLogBroker {
    state: Arc<State>,
}

impl Default for MemoryLogBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                faults: Faults::default(),
                auto_create_topics: AtomicBool::new(true),
                max_retries: AtomicUsize::new(DEFAULT_MAX_RETRIES),
                retry_backoff: Mutex::new(Duration::from_millis(5)),
                logs: Mutex::new(Logs::default()),
                appended: Notify::new(),
                connected_producers: AtomicUsize::new(0),
                connected_consumers: AtomicUsize::new(0),
                failed_records: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.state.faults
    }

    /// When off, producing to or subscribing to a missing topic fails with
    /// `Topic does not exist`.
    pub fn set_auto_create_topics(&self, enabled: bool) {
        self.state.auto_create_topics.store(enabled, Ordering::SeqCst);
    }

    pub fn set_max_retries(&self, retries: usize) {
        self.state.max_retries.store(retries, Ordering::SeqCst);
    }

    pub fn set_retry_backoff(&self, backoff: Duration) {
        *lock(&self.state.retry_backoff) = backoff;
    }

    pub fn create_topic(&self, topic: &str) {
        lock(&self.state.logs)
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    /// Append a raw record, as an external producer would.
    pub fn append(&self, topic: &str, value: Option<Vec<u8>>) {
        lock(&self.state.logs)
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(StoredRecord {
                key: None,
                value,
                headers: Vec::new(),
            });
        self.state.appended.notify_waiters();
    }

    /// Every record in `topic`, in offset order.
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        lock(&self.state.logs)
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset `group` will read from `topic`.
    pub fn group_offset(&self, group: &str, topic: &str) -> Option<usize> {
        lock(&self.state.logs)
            .offsets
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    pub fn connected_producers(&self) -> usize {
        self.state.connected_producers.load(Ordering::SeqCst)
    }

    pub fn connected_consumers(&self) -> usize {
        self.state.connected_consumers.load(Ordering::SeqCst)
    }

    /// Records abandoned by a crashed consumer loop.
    pub fn failed_records(&self) -> Vec<ConsumedRecord> {
        lock(&self.state.failed_records).clone()
    }
}

impl LogBrokerClient for MemoryLogBroker {
    fn producer(&self) -> Arc<dyn LogProducer> {
        Arc::new(MemoryProducer {
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(false),
        })
    }

    fn consumer(&self, group_id: &str) -> Arc<dyn LogConsumer> {
        Arc::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            group_id: group_id.to_string(),
            connected: AtomicBool::new(false),
            topics: Mutex::new(Vec::new()),
            stopped: Notify::new(),
        })
    }
}

struct MemoryProducer {
    state: Arc<State>,
    connected: AtomicBool,
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn connect(&self) -> Result<(), TransportError> {
        // Yield once so concurrent callers overlap the connect, as with a socket.
        tokio::task::yield_now().await;
        self.state.faults.check(Operation::ProducerConnect)?;
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.state.connected_producers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn send(&self, record: ProducerRecord) -> Result<(), TransportError> {
        self.state.faults.check(Operation::Send)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::new("producer is not connected"));
        }
        {
            let mut logs = lock(&self.state.logs);
            let auto_create = self.state.auto_create_topics.load(Ordering::SeqCst);
            if !auto_create && !logs.topics.contains_key(&record.topic) {
                return Err(TransportError::new("Topic does not exist"));
            }
            logs.topics.entry(record.topic).or_default().push(StoredRecord {
                key: record.key,
                value: Some(record.value),
                headers: record.headers,
            });
        }
        self.state.appended.notify_waiters();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.faults.check(Operation::ProducerDisconnect)?;
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.connected_producers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<State>,
    group_id: String,
    connected: AtomicBool,
    topics: Mutex<Vec<String>>,
    stopped: Notify,
}

impl MemoryConsumer {
    /// Take the next unread record of any subscribed topic for this group.
    fn claim(&self) -> Option<ConsumedRecord> {
        let topics = lock(&self.topics).clone();
        let mut logs = lock(&self.state.logs);
        for topic in topics {
            let key = (self.group_id.clone(), topic.clone());
            let next = logs.offsets.get(&key).copied().unwrap_or(0);
            let Some(stored) = logs.topics.get(&topic).and_then(|log| log.get(next)).cloned() else {
                continue;
            };
            logs.offsets.insert(key, next + 1);
            return Some(ConsumedRecord {
                topic,
                partition: 0,
                offset: next as i64,
                key: stored.key,
                value: stored.value,
                headers: stored.headers,
            });
        }
        None
    }

    async fn handle(&self, handler: &RecordHandler, record: ConsumedRecord) -> Result<(), TransportError> {
        let max_retries = self.state.max_retries.load(Ordering::SeqCst);
        let mut attempt = 0;
        loop {
            let err = match handler(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if attempt >= max_retries {
                lock(&self.state.failed_records).push(record.clone());
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
            let backoff = *lock(&self.state.retry_backoff);
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn connect(&self) -> Result<(), TransportError> {
        self.state.faults.check(Operation::ConsumerConnect)?;
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.state.connected_consumers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), TransportError> {
        self.state.faults.check(Operation::Subscribe)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::new("consumer is not connected"));
        }

        {
            let mut logs = lock(&self.state.logs);
            let existing = logs.topics.get(topic).map(Vec::len);
            let end = match existing {
                Some(len) => len,
                None if self.state.auto_create_topics.load(Ordering::SeqCst) => {
                    logs.topics.insert(topic.to_string(), Vec::new());
                    0
                }
                None => return Err(TransportError::new("Topic does not exist")),
            };
            let start = if from_beginning { 0 } else { end };
            logs.offsets
                .entry((self.group_id.clone(), topic.to_string()))
                .or_insert(start);
        }

        lock(&self.topics).push(topic.to_string());
        Ok(())
    }

    async fn run(&self, handler: RecordHandler) -> Result<(), TransportError> {
        self.state.faults.check(Operation::Run)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::new("consumer is not connected"));
        }

        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.claim() {
                Some(record) => self.handle(&handler, record).await?,
                None => {
                    tokio::select! {
                        _ = self.state.appended.notified() => {}
                        _ = self.stopped.notified() => {}
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.faults.check(Operation::ConsumerDisconnect)?;
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.connected_consumers.fetch_sub(1, Ordering::SeqCst);
        } else {
            warn!(group_id = %self.group_id, "disconnect on a consumer that is not connected");
        }
        self.stopped.notify_waiters();
        Ok(())
    }
}
