use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures_lite::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::amqp_client::BrokerChannel;
use super::channel_manager::ChannelConfig;
use super::connection::{ConnectionManager, DEFAULT_RECONNECT_DELAY};
use super::delivery::Delivery;
use super::errors::Result;
use super::topology::Topology;

/// Processes deliveries from one queue.
///
/// A handler is expected to `ack` the delivery itself once its work is done.
/// Returning an error (or returning without acking) leaves settlement to the
/// group's [`FailurePolicy`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// What the group does with a delivery whose handler failed without settling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Leave it unacknowledged; the broker requeues it when the channel closes.
    #[default]
    LeaveUnacked,
    /// Negative-acknowledge with requeue.
    Requeue,
    /// Negative-acknowledge without requeue (dead-lettered if the queue has a DLX).
    Reject,
}

#[derive(Clone)]
pub struct HandlerBinding {
    pub topology: Topology,
    pub handler: Arc<dyn Handler>,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base delay before a failed or ended loop starts again.
    pub restart_delay: Duration,
    /// Broker-side limit on unacknowledged deliveries per loop, 0 for none.
    /// Deliveries left unsettled count against it until the loop's channel
    /// closes, so a loop holding `prefetch_count` of them recycles its channel.
    pub prefetch_count: u16,
    pub failure_policy: FailurePolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            restart_delay: DEFAULT_RECONNECT_DELAY,
            prefetch_count: 0,
            failure_policy: FailurePolicy::default(),
        }
    }
}

struct ConsumerLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

enum LoopExit {
    Cancelled,
    StreamEnded,
    /// Every prefetch slot is held by an unsettled delivery.
    PrefetchExhausted(usize),
}

/// Runs one supervised delivery loop per registered queue over a shared
/// [`ConnectionManager`].
pub struct ConsumerGroup {
    connections: Arc<ConnectionManager>,
    config: ConsumerConfig,
    handlers: RwLock<HashMap<String, HandlerBinding>>,
    loops: Mutex<HashMap<String, ConsumerLoop>>,
    shutdown: CancellationToken,
}

impl ConsumerGroup {
    pub fn new(connections: Arc<ConnectionManager>, config: ConsumerConfig) -> Self {
        Self {
            connections,
            config,
            handlers: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stores the handler for `queue`. A loop that is already running keeps the
    /// binding it started with; only a later [`run`](Self::run) after the loop
    /// stops picks up the new one.
    pub fn register_handler(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let topology = Topology::new(exchange, queue);
        topology.validate()?;
        let queue = topology.queue.clone();

        if self.is_running(&queue) {
            warn!(queue = %queue, "Handler registered for a running queue, it applies after the loop restarts via run()");
        }

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue, HandlerBinding { topology, handler });
        Ok(())
    }

    pub fn registered_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        queues.sort();
        queues
    }

    /// Starts a loop for every registered queue that does not have a live one.
    /// Returns how many loops were started.
    pub fn run(&self) -> usize {
        let bindings: Vec<HandlerBinding> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        loops.retain(|_, running| !running.handle.is_finished());

        let mut started = 0;
        for binding in bindings {
            let queue = binding.topology.queue.clone();
            if loops.contains_key(&queue) {
                continue;
            }

            info!(queue = %queue, exchange = %binding.topology.exchange, "Running consumer");
            let token = self.shutdown.child_token();
            let handle = tokio::spawn(supervise(
                self.connections.clone(),
                binding,
                self.config.clone(),
                token.clone(),
            ));
            loops.insert(queue, ConsumerLoop { token, handle });
            started += 1;
        }
        started
    }

    pub fn is_running(&self, queue: &str) -> bool {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn running_queues(&self) -> Vec<String> {
        let loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        let mut queues: Vec<String> = loops
            .iter()
            .filter(|(_, running)| !running.handle.is_finished())
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues
    }

    /// Cancels the loop for `queue` and waits for it to finish its current
    /// delivery. Returns false if no loop was running.
    pub async fn stop(&self, queue: &str) -> bool {
        let running = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue);

        match running {
            Some(running) => {
                running.token.cancel();
                if let Err(e) = running.handle.await {
                    error!(queue = %queue, error = %e, "Consumer loop task failed");
                }
                true
            }
            None => false,
        }
    }

    /// Cancels every loop and waits for all of them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let running: Vec<(String, ConsumerLoop)> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (queue, running) in running {
            if let Err(e) = running.handle.await {
                error!(queue = %queue, error = %e, "Consumer loop task failed");
            }
        }
        info!("Consumer group stopped");
    }
}

impl Drop for ConsumerGroup {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn supervise(
    connections: Arc<ConnectionManager>,
    binding: HandlerBinding,
    config: ConsumerConfig,
    token: CancellationToken,
) {
    let queue = binding.topology.queue.clone();
    let mut restarts: u64 = 0;

    loop {
        if token.is_cancelled() || connections.is_closed() {
            break;
        }

        match consume(&connections, &binding, &config, &token).await {
            Ok(LoopExit::Cancelled) => break,
            Ok(LoopExit::StreamEnded) => warn!(queue = %queue, "Delivery stream ended"),
            Ok(LoopExit::PrefetchExhausted(held)) => error!(
                queue = %queue,
                held,
                "Unsettled deliveries fill the prefetch window, recycling the channel so the broker requeues them"
            ),
            Err(e) => error!(queue = %queue, error = %e, "Consumer loop failed"),
        }

        if connections.is_closed() {
            break;
        }

        restarts += 1;
        let delay = jittered(config.restart_delay);
        info!(queue = %queue, restarts, delay = ?delay, "Restarting consumer loop after delay");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = token.cancelled() => break,
        }
    }

    info!(queue = %queue, "Consumer loop stopped");
}

// ±15%, saturating at Duration::MAX
fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + (rand::random::<f64>() * 0.3 - 0.15);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

async fn consume(
    connections: &ConnectionManager,
    binding: &HandlerBinding,
    config: &ConsumerConfig,
    token: &CancellationToken,
) -> Result<LoopExit> {
    let channel_config = ChannelConfig {
        prefetch_count: config.prefetch_count,
        confirm_mode: false,
        id: format!("consumer-{}", binding.topology.queue),
    };
    let channel = connections.create_channel(&channel_config).await?;

    let exit = consume_on(channel.as_ref(), binding, config, token).await;

    if let Err(e) = channel.close().await {
        debug!(queue = %binding.topology.queue, error = %e, "Closing consumer channel failed");
    }
    exit
}

async fn consume_on(
    channel: &dyn BrokerChannel,
    binding: &HandlerBinding,
    config: &ConsumerConfig,
    token: &CancellationToken,
) -> Result<LoopExit> {
    let topology = &binding.topology;
    channel.declare_topology(topology).await?;

    let consumer_tag = format!("{}-{}", topology.queue, &Uuid::new_v4().to_string()[..8]);
    let mut deliveries = channel.consume(&topology.queue, &consumer_tag).await?;
    info!(
        queue = %topology.queue,
        exchange = %topology.exchange,
        consumer_tag = %consumer_tag,
        "Started consuming"
    );

    let window = usize::from(config.prefetch_count);
    let mut held = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(LoopExit::Cancelled),
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if !dispatch(binding, config.failure_policy, delivery).await {
                    held += 1;
                    if window > 0 && held >= window {
                        return Ok(LoopExit::PrefetchExhausted(held));
                    }
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(LoopExit::StreamEnded),
        }
    }
}

/// Runs the handler on one delivery. Returns whether the delivery ended up settled.
async fn dispatch(binding: &HandlerBinding, policy: FailurePolicy, delivery: Delivery) -> bool {
    let span = info_span!(
        "delivery",
        queue = %binding.topology.queue,
        request_id = %delivery.request_id().unwrap_or_default(),
        delivery_tag = delivery.delivery_tag,
    );

    async {
        let outcome = AssertUnwindSafe(binding.handler.handle(&delivery))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));

        match outcome {
            Ok(()) => {
                if !delivery.is_settled() {
                    warn!("Handler returned without acknowledging the delivery");
                }
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Handler failed to process delivery");
                if delivery.is_settled() {
                    return true;
                }
                let settled = match policy {
                    FailurePolicy::LeaveUnacked => {
                        debug!("Leaving delivery unacknowledged");
                        Ok(())
                    }
                    FailurePolicy::Requeue => delivery.nack(true).await,
                    FailurePolicy::Reject => delivery.nack(false).await,
                };
                if let Err(e) = settled {
                    error!(error = %e, "Failed to settle delivery after handler error");
                }
            }
        }
        delivery.is_settled()
    }
    .instrument(span)
    .await
}
