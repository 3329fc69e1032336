//! In-process broker implementing the broker seam.
//!
//! Topic routing, durable queues, manual acknowledgment and requeue-on-close
//! behave like RabbitMQ closely enough to exercise reconnection and consumer
//! supervision without a server. Fault injection covers an unreachable broker,
//! failing publishes and broker-side connection closes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::amqp_client::{
    Broker, BrokerChannel, BrokerConnection, CloseReason, DeliveryStream,
};
use super::channel_manager::ChannelConfig;
use super::delivery::{AckHandle, Delivery};
use super::endpoint::BrokerEndpoint;
use super::errors::{RabbitMQError, Result};
use super::message::OutboundMessage;
use super::topology::Topology;

/// A message as held in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
}

/// Counters for everything the broker has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub dial_attempts: usize,
    pub connections_opened: usize,
    pub channels_opened: usize,
    pub topology_declarations: usize,
    pub publish_attempts: usize,
    pub messages_routed: usize,
    pub acks: usize,
    pub nacks: usize,
    /// Highest number of publishes seen in flight at once on a single channel.
    pub max_concurrent_publishes: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                reachable: true,
                ..State::default()
            }),
        }
    }
}

#[derive(Default)]
struct State {
    reachable: bool,
    fail_publishes: bool,
    credentials: Option<(String, String)>,
    next_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, watch::Sender<Option<CloseReason>>>,
    channels: HashMap<u64, ChannelEntry>,
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    dead_letters: Vec<StoredMessage>,
    stats: BrokerStats,
}

struct ChannelEntry {
    connection_id: u64,
    open: Arc<AtomicBool>,
    prefetch: u16,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    channel_id: u64,
    message: StoredMessage,
}

struct ConsumerSlot {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects dials whose credentials differ from these.
    pub fn with_credentials(self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.shared.lock().credentials = Some((user.into(), password.into()));
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.shared.lock().fail_publishes = fail;
    }

    /// Closes every live connection from the broker side, as a broker restart
    /// or `rabbitmqctl close_connection` would.
    pub fn sever_connections(&self, reason: &str) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            close_connection(&self.shared, &mut state, id, CloseReason::Remote(reason.to_string()));
        }
    }

    pub fn live_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.lock().stats.clone()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Binding keys from `exchange` to queues, as `(routing_key, queue)`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.shared
            .lock()
            .bindings
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages waiting in `queue`, not yet handed to a consumer.
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages dropped by a nack without requeue.
    pub fn dead_letters(&self) -> Vec<StoredMessage> {
        self.shared.lock().dead_letters.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.shared.lock();
        state.stats.dial_attempts += 1;

        if !state.reachable {
            return Err(RabbitMQError::Dial {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        if let Some((user, password)) = &state.credentials {
            if endpoint.user() != user.as_str() || endpoint.password() != password.as_str() {
                return Err(RabbitMQError::Dial {
                    endpoint: endpoint.to_string(),
                    reason: "ACCESS_REFUSED - login refused".into(),
                });
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        let (tx, rx) = watch::channel(None);
        state.connections.insert(id, tx);
        state.stats.connections_opened += 1;
        debug!(connection_id = id, "Memory broker accepted connection");

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
            closed_rx: rx,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.shared.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(RabbitMQError::SessionUnavailable("connection is closed".into()));
        }

        state.next_id += 1;
        let id = state.next_id;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.id,
                open: open.clone(),
                prefetch: config.prefetch_count,
            },
        );
        state.stats.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
            open,
            in_flight: AtomicUsize::new(0),
        }))
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Local),
            Err(_) => CloseReason::Local,
        };
        reason
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        close_connection(&self.shared, &mut state, self.id, CloseReason::Local);
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    open: Arc<AtomicBool>,
    in_flight: AtomicUsize,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".into()))
        }
    }

    fn route(&self, message: &OutboundMessage) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open()?;

        if state.fail_publishes {
            return Err(RabbitMQError::PublishError("injected publish failure".into()));
        }

        let Some(bindings) = state.bindings.get(&message.exchange) else {
            close_channel(&self.shared, &mut state, self.id);
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                message.exchange
            )));
        };

        let mut targets: Vec<String> = bindings
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, &message.routing_key))
            .map(|(_, queue)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            return Err(RabbitMQError::PublishError(format!(
                "NO_ROUTE - message to '{}' with key '{}' is unroutable",
                message.exchange, message.routing_key
            )));
        }

        for queue in &targets {
            let stored = StoredMessage {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                content_type: message.content_type.clone(),
                persistent: message.persistent,
                headers: message.headers.clone(),
                redelivered: false,
            };
            state.queues.entry(queue.clone()).or_default().ready.push_back(stored);
            state.stats.messages_routed += 1;
            dispatch(&self.shared, &mut state, queue);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;
        let mut state = self.shared.lock();
        self.ensure_open()?;

        state.stats.topology_declarations += 1;
        state.queues.entry(topology.queue.clone()).or_default();
        let bindings = state.bindings.entry(topology.exchange.clone()).or_default();
        let binding = (topology.routing_key.clone(), topology.queue.clone());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        self.ensure_open()?;
        self.shared.lock().stats.publish_attempts += 1;

        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut state = self.shared.lock();
            if in_flight > state.stats.max_concurrent_publishes {
                state.stats.max_concurrent_publishes = in_flight;
            }
        }
        // Give concurrent publishers on this channel a chance to interleave.
        tokio::task::yield_now().await;

        let routed = self.route(message);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        routed
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.shared.lock();
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(ConsumerSlot {
                channel_id: self.id,
                tx,
            }),
            None => {
                return Err(RabbitMQError::ConsumeError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )))
            }
        }
        dispatch(&self.shared, &mut state, queue);

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        close_channel(&self.shared, &mut state, self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn take_unacked(&self, state: &mut State) -> Result<StoredMessage> {
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .map(|unacked| unacked.message)
            .ok_or_else(|| {
                RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    self.tag
                ))
            })
    }
}

#[async_trait]
impl AckHandle for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.shared.lock();
        self.take_unacked(&mut state)?;
        state.stats.acks += 1;
        dispatch(&self.shared, &mut state, &self.queue);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = self.shared.lock();
        let mut message = self.take_unacked(&mut state)?;
        state.stats.nacks += 1;

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
        } else {
            state.dead_letters.push(message);
        }
        dispatch(&self.shared, &mut state, &self.queue);
        Ok(())
    }
}

fn close_connection(shared: &Arc<Shared>, state: &mut State, id: u64, reason: CloseReason) {
    let Some(closed_tx) = state.connections.remove(&id) else {
        return;
    };

    let channel_ids: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, entry)| entry.connection_id == id)
        .map(|(channel_id, _)| *channel_id)
        .collect();
    for channel_id in channel_ids {
        close_channel(shared, state, channel_id);
    }

    debug!(connection_id = id, reason = ?reason, "Memory broker closed connection");
    closed_tx.send_replace(Some(reason));
}

fn close_channel(shared: &Arc<Shared>, state: &mut State, channel_id: u64) {
    let Some(entry) = state.channels.remove(&channel_id) else {
        return;
    };
    entry.open.store(false, Ordering::Release);

    let mut touched = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        let before = queue.consumers.len();
        queue.consumers.retain(|slot| slot.channel_id != channel_id);

        let tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue at the head, oldest delivery first.
        for tag in tags.iter().rev() {
            if let Some(mut unacked) = queue.unacked.remove(tag) {
                unacked.message.redelivered = true;
                queue.ready.push_front(unacked.message);
            }
        }

        if before != queue.consumers.len() || !tags.is_empty() {
            touched.push(name.clone());
        }
    }

    for name in touched {
        dispatch(shared, state, &name);
    }
}

fn dispatch(shared: &Arc<Shared>, state: &mut State, queue_name: &str) {
    let State {
        queues,
        channels,
        next_delivery_tag,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() && !queue.consumers.is_empty() {
        let Some(index) = next_consumer(queue, channels) else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        *next_delivery_tag += 1;
        let tag = *next_delivery_tag;
        let delivery = Delivery::new(
            tag,
            message.body.clone(),
            Box::new(MemoryAcker {
                shared: shared.clone(),
                queue: queue_name.to_string(),
                tag,
            }),
        )
        .with_routing(message.exchange.as_str(), message.routing_key.as_str())
        .with_redelivered(message.redelivered)
        .with_content_type(Some(message.content_type.clone()))
        .with_headers(message.headers.clone());

        let channel_id = queue.consumers[index].channel_id;
        if queue.consumers[index].tx.send(delivery).is_err() {
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            continue;
        }

        queue.next_consumer = index + 1;
        queue.unacked.insert(tag, Unacked { channel_id, message });
    }
}

// Round-robin over consumers whose channel has prefetch headroom.
fn next_consumer(queue: &QueueState, channels: &HashMap<u64, ChannelEntry>) -> Option<usize> {
    let count = queue.consumers.len();
    (0..count)
        .map(|offset| (queue.next_consumer + offset) % count)
        .find(|&index| {
            let channel_id = queue.consumers[index].channel_id;
            let prefetch = channels.get(&channel_id).map(|c| c.prefetch).unwrap_or(0);
            if prefetch == 0 {
                return true;
            }
            let outstanding = queue
                .unacked
                .values()
                .filter(|u| u.channel_id == channel_id)
                .count();
            outstanding < usize::from(prefetch)
        })
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}
