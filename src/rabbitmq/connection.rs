use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::amqp_client::{Broker, BrokerChannel, BrokerConnection, CloseReason};
use super::channel_manager::ChannelConfig;
use super::endpoint::BrokerEndpoint;
use super::errors::{RabbitMQError, Result};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Lifecycle of a [`ConnectionManager`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Owns the single current connection to the broker and replaces it when the
/// broker drops it.
///
/// The current connection is only swapped while the reconnect task holds the
/// write half of `current`. Readers never wait on that lock: while a reconnect
/// is in progress they get [`RabbitMQError::SessionUnavailable`] and are
/// expected to back off.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    endpoint: BrokerEndpoint,
    reconnect_delay: Duration,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reconnects: AtomicU64,
}

impl ConnectionManager {
    pub async fn connect(broker: Arc<dyn Broker>, endpoint: BrokerEndpoint) -> Result<Arc<Self>> {
        Self::connect_with_delay(broker, endpoint, DEFAULT_RECONNECT_DELAY).await
    }

    /// Dials once; a failure here is returned and nothing is left running.
    /// On success a background task starts watching the connection.
    pub async fn connect_with_delay(
        broker: Arc<dyn Broker>,
        endpoint: BrokerEndpoint,
        reconnect_delay: Duration,
    ) -> Result<Arc<Self>> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Arc::new(Self {
            broker,
            endpoint,
            reconnect_delay,
            current: RwLock::new(None),
            state,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reconnects: AtomicU64::new(0),
        });

        manager.set_state(ConnectionState::Connecting);
        info!(endpoint = %manager.endpoint, "Connecting to RabbitMQ");
        let connection = match manager.broker.dial(&manager.endpoint).await {
            Ok(connection) => connection,
            Err(e) => {
                manager.set_state(ConnectionState::Disconnected);
                error!(endpoint = %manager.endpoint, error = %e, "Initial RabbitMQ connection failed");
                return Err(e);
            }
        };

        *manager.current.write().await = Some(connection.clone());
        manager.set_state(ConnectionState::Connected);
        info!(endpoint = %manager.endpoint, "Successfully connected to RabbitMQ");

        tokio::spawn(watch_connection(
            Arc::downgrade(&manager),
            connection,
            manager.shutdown.clone(),
        ));

        Ok(manager)
    }

    /// The current connection, without waiting on an in-progress reconnect.
    pub fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        if self.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        match self.current.try_read() {
            Ok(current) => current.clone().ok_or_else(|| {
                RabbitMQError::SessionUnavailable("no current connection".into())
            }),
            Err(_) => Err(RabbitMQError::SessionUnavailable(
                "reconnection in progress".into(),
            )),
        }
    }

    pub async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.connection()?;
        connection.create_channel(config).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Waits until the manager reports `target`. Returns false if the manager
    /// closed first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let mut rx = self.subscribe();
        let reached = match rx
            .wait_for(|state| *state == target || *state == ConnectionState::Closed)
            .await
        {
            Ok(state) => *state == target,
            Err(_) => false,
        };
        reached
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of successful reconnects since construction.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Stops reconnecting and closes the current connection. Only the first
    /// call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let connection = self.current.write().await.take();
        self.set_state(ConnectionState::Closed);
        info!(endpoint = %self.endpoint, "Closing RabbitMQ connection");

        match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    async fn reconnect(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut current = self.current.write().await;
        if self.is_closed() {
            return None;
        }
        current.take();
        self.set_state(ConnectionState::Reconnecting);

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let dialed = tokio::select! {
                dialed = self.broker.dial(&self.endpoint) => dialed,
                _ = self.shutdown.cancelled() => return None,
            };

            match dialed {
                Ok(connection) => {
                    *current = Some(connection.clone());
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    info!(attempt, endpoint = %self.endpoint, "Re-established RabbitMQ connection");
                    return Some(connection);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        delay = ?self.reconnect_delay,
                        "Cannot establish RabbitMQ connection, retrying after delay"
                    );
                    tokio::select! {
                        _ = sleep(self.reconnect_delay) => {}
                        _ = self.shutdown.cancelled() => return None,
                    }
                }
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn watch_connection(
    manager: Weak<ConnectionManager>,
    mut connection: Arc<dyn BrokerConnection>,
    shutdown: CancellationToken,
) {
    loop {
        let reason = tokio::select! {
            reason = connection.closed() => reason,
            _ = shutdown.cancelled() => return,
        };

        let Some(manager) = manager.upgrade() else {
            return;
        };

        match reason {
            CloseReason::Local => {
                debug!("RabbitMQ connection closed locally, watcher exiting");
                return;
            }
            CloseReason::Remote(reason) => {
                warn!(reason = %reason, "RabbitMQ connection closed");
            }
        }

        if manager.is_closed() {
            return;
        }

        match manager.reconnect().await {
            Some(next) => connection = next,
            None => return,
        }
    }
}
