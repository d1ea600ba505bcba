//! In-process AMQP broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::faults::{Faults, Operation};
use crate::amqp::{AmqpBody, AmqpConnection, DeliveryHandler, PublishProperties, QueueBinding};
use crate::error::TransportError;

/// Default number of redeliveries before a message is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: usize = 5;

/// A message as it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
}

impl PublishedMessage {
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A message that was nacked more times than allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub message_id: String,
    pub body: Vec<u8>,
    pub last_error: String,
}

#[derive(Clone)]
struct QueuedMessage {
    message_id: String,
    body: Vec<u8>,
    attempts: usize,
}

#[derive(Default)]
struct QueueState {
    subscribers: Vec<DeliveryHandler>,
    next_subscriber: usize,
    backlog: VecDeque<QueuedMessage>,
}

#[derive(Default)]
struct Topology {
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, QueueState>,
}

struct State {
    connected: AtomicBool,
    confirms: AtomicBool,
    decode_json: AtomicBool,
    max_redeliveries: AtomicUsize,
    faults: Faults,
    topology: Mutex<Topology>,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<String>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process AMQP broker for tests and single-process setups.
///
/// - exchanges route by exact routing key to every bound queue
/// - subscribers on one queue compete, round-robin
/// - a handler `Err` requeues the message; after `max_redeliveries` it is
///   dead-lettered
/// - messages routed to no queue are dropped, as on a real broker
///
/// Starts disconnected, like a client that has not dialled yet. Clones share
/// the same broker.
#[derive(Clone)]
pub struct MemoryAmqpBroker {
    state: Arc<State>,
}

impl Default for MemoryAmqpBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAmqpBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                connected: AtomicBool::new(false),
                confirms: AtomicBool::new(true),
                decode_json: AtomicBool::new(false),
                max_redeliveries: AtomicUsize::new(DEFAULT_MAX_REDELIVERIES),
                faults: Faults::default(),
                topology: Mutex::new(Topology::default()),
                published: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                dead_letters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.state.faults
    }

    /// Simulate the connection dropping (or coming back).
    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// When off, the broker receives messages but reports them unconfirmed.
    pub fn set_confirms(&self, confirms: bool) {
        self.state.confirms.store(confirms, Ordering::SeqCst);
    }

    /// Hand JSON bodies over already decoded, like clients that parse by content type.
    pub fn set_decode_json(&self, decode: bool) {
        self.state.decode_json.store(decode, Ordering::SeqCst);
    }

    pub fn set_max_redeliveries(&self, max: usize) {
        self.state.max_redeliveries.store(max, Ordering::SeqCst);
    }

    /// Every message published, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state.published).clone()
    }

    /// Ids of messages a subscriber handled successfully.
    pub fn acknowledged(&self) -> Vec<String> {
        lock(&self.state.acked).clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state.dead_letters).clone()
    }

    /// Total active subscribers across every queue.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state.topology)
            .queues
            .values()
            .map(|q| q.subscribers.len())
            .sum()
    }

    pub fn subscribers_on(&self, queue: &str) -> usize {
        lock(&self.state.topology)
            .queues
            .get(queue)
            .map(|q| q.subscribers.len())
            .unwrap_or(0)
    }

    /// Messages waiting in `queue` with no subscriber to take them.
    pub fn backlog(&self, queue: &str) -> usize {
        lock(&self.state.topology)
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Hand every backlog message of `queue` to a subscriber.
    fn dispatch(state: &Arc<State>, queue: &str) {
        let deliveries: Vec<(DeliveryHandler, QueuedMessage)> = {
            let mut topology = lock(&state.topology);
            let Some(q) = topology.queues.get_mut(queue) else {
                return;
            };
            if q.subscribers.is_empty() {
                return;
            }
            let mut deliveries = Vec::new();
            while let Some(message) = q.backlog.pop_front() {
                let idx = q.next_subscriber % q.subscribers.len();
                q.next_subscriber = q.next_subscriber.wrapping_add(1);
                deliveries.push((Arc::clone(&q.subscribers[idx]), message));
            }
            deliveries
        };

        for (handler, message) in deliveries {
            Self::deliver(Arc::clone(state), queue.to_string(), handler, message);
        }
    }

    fn deliver(state: Arc<State>, queue: String, handler: DeliveryHandler, mut message: QueuedMessage) {
        tokio::spawn(async move {
            let text = String::from_utf8_lossy(&message.body).into_owned();
            let body = if state.decode_json.load(Ordering::SeqCst) {
                match serde_json::from_str(&text) {
                    Ok(value) => AmqpBody::Json(value),
                    Err(_) => AmqpBody::Text(text),
                }
            } else {
                AmqpBody::Text(text)
            };

            match handler(body).await {
                Ok(()) => lock(&state.acked).push(message.message_id),
                Err(err) => {
                    message.attempts += 1;
                    if message.attempts > state.max_redeliveries.load(Ordering::SeqCst) {
                        warn!(queue = %queue, message_id = %message.message_id, error = %err, "dead-lettering message");
                        lock(&state.dead_letters).push(DeadLetter {
                            queue,
                            message_id: message.message_id,
                            body: message.body,
                            last_error: err.to_string(),
                        });
                        return;
                    }
                    debug!(queue = %queue, message_id = %message.message_id, attempts = message.attempts, "nack, requeueing");
                    if let Some(q) = lock(&state.topology).queues.get_mut(&queue) {
                        q.backlog.push_back(message);
                    }
                    Self::dispatch(&state, &queue);
                }
            }
        });
    }
}

#[async_trait]
impl AmqpConnection for MemoryAmqpBroker {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn init(&self) -> Result<(), TransportError> {
        self.state.faults.check(Operation::Init)?;
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<bool, TransportError> {
        self.state.faults.check(Operation::Publish)?;
        if !self.is_connected() {
            return Err(TransportError::new("connection closed"));
        }

        lock(&self.state.published).push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.clone(),
            properties: properties.clone(),
        });

        if !self.state.confirms.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let queues = {
            let mut topology = lock(&self.state.topology);
            let queues = topology
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .cloned()
                .unwrap_or_default();
            for queue in &queues {
                topology
                    .queues
                    .entry(queue.clone())
                    .or_default()
                    .backlog
                    .push_back(QueuedMessage {
                        message_id: properties.message_id.clone(),
                        body: body.clone(),
                        attempts: 0,
                    });
            }
            queues
        };

        if queues.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        for queue in queues {
            Self::dispatch(&self.state, &queue);
        }
        Ok(true)
    }

    async fn create_subscriber(
        &self,
        binding: QueueBinding,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError> {
        self.state.faults.check(Operation::CreateSubscriber)?;
        if !self.is_connected() {
            return Err(TransportError::new("connection closed"));
        }

        {
            let mut topology = lock(&self.state.topology);
            let bound = topology
                .bindings
                .entry((binding.exchange.clone(), binding.routing_key.clone()))
                .or_default();
            if !bound.contains(&binding.queue) {
                bound.push(binding.queue.clone());
            }
            topology
                .queues
                .entry(binding.queue.clone())
                .or_default()
                .subscribers
                .push(handler);
        }

        Self::dispatch(&self.state, &binding.queue);
        Ok(())
    }
}
