use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use rabbit_relay::rabbitmq::{
    BrokerEndpoint, ConnectionManager, Delivery, Handler, MemoryBroker, Publisher,
    PublisherConfig,
};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

pub fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new("user", "user", "localhost", 5672)
}

pub async fn connect(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    ConnectionManager::connect_with_delay(Arc::new(broker.clone()), endpoint(), RECONNECT_DELAY)
        .await
        .expect("memory broker accepts the dial")
}

pub async fn publisher(connections: &Arc<ConnectionManager>, exchange: &str, queue: &str) -> Publisher {
    Publisher::new(connections.clone(), PublisherConfig::new(exchange, queue))
        .await
        .expect("publisher starts")
}

/// Polls `check` until it holds or `limit` of (paused) time passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Ack,
    /// Returns an error without settling.
    Fail,
    /// Fails the first delivery, acks the rest.
    FailOnce,
    /// Acks, then tries to ack again.
    AckTwice,
    /// Panics on a body of `"boom"`, acks anything else.
    PanicOnBoom,
    /// Fails bodies starting with `bad-`, acks anything else.
    FailBad,
    /// Fails bodies starting with `bad-` unless redelivered, acks anything else.
    FailBadFirstTime,
}

#[derive(Debug, Clone)]
pub struct Seen {
    pub body: String,
    pub request_id: Option<String>,
    pub redelivered: bool,
}

pub struct RecordingHandler {
    behavior: Behavior,
    calls: AtomicUsize,
    second_ack_refused: AtomicUsize,
    seen: Mutex<Vec<Seen>>,
}

impl RecordingHandler {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            second_ack_refused: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn second_acks_refused(&self) -> usize {
        self.second_ack_refused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let body = String::from_utf8_lossy(&delivery.body).into_owned();
        self.seen.lock().unwrap().push(Seen {
            body: body.clone(),
            request_id: delivery.request_id().map(str::to_string),
            redelivered: delivery.redelivered,
        });

        match self.behavior {
            Behavior::Ack => delivery.ack().await?,
            Behavior::Fail => anyhow::bail!("cannot process {}", body),
            Behavior::FailOnce if call == 0 => anyhow::bail!("first attempt fails"),
            Behavior::FailOnce => delivery.ack().await?,
            Behavior::AckTwice => {
                delivery.ack().await?;
                if delivery.ack().await.is_err() {
                    self.second_ack_refused.fetch_add(1, Ordering::SeqCst);
                }
            }
            Behavior::FailBad if body.starts_with("bad-") => anyhow::bail!("rejecting {}", body),
            Behavior::FailBadFirstTime if body.starts_with("bad-") && !delivery.redelivered => {
                anyhow::bail!("rejecting {} on first delivery", body)
            }
            Behavior::FailBad | Behavior::FailBadFirstTime => delivery.ack().await?,
            Behavior::PanicOnBoom => {
                if body == "boom" {
                    panic!("handler blew up");
                }
                delivery.ack().await?;
            }
        }
        Ok(())
    }
}
