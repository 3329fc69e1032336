use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::BrokerChannel;
use super::connection::ConnectionManager;
use super::errors::Result;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Exclusive access to the managed channel slot.
pub type ChannelSlot<'a> = MutexGuard<'a, Option<Arc<dyn BrokerChannel>>>;

/// Owns one long-lived channel drawn from the current connection.
///
/// The slot is behind an async mutex: whoever holds the guard is the only user
/// of the channel until the guard drops.
pub struct ChannelManager {
    connections: Arc<ConnectionManager>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(connections: Arc<ConnectionManager>, config: ChannelConfig) -> Self {
        debug!(
            channel_id = %config.id,
            prefetch = %config.prefetch_count,
            confirm = %config.confirm_mode,
            "Creating channel manager"
        );

        Self {
            connections,
            channel: Mutex::new(None),
            config,
        }
    }

    pub async fn lock(&self) -> ChannelSlot<'_> {
        self.channel.lock().await
    }

    /// Returns the channel in `slot`, opening a new one if it is absent or closed.
    /// The flag is true when the channel was opened by this call.
    pub async fn get_channel(
        &self,
        slot: &mut ChannelSlot<'_>,
    ) -> Result<(Arc<dyn BrokerChannel>, bool)> {
        if let Some(channel) = &**slot {
            if channel.is_open() {
                return Ok((channel.clone(), false));
            }
            debug!(channel_id = %self.config.id, "Discarding closed channel");
        }
        slot.take();

        let channel = self.open_channel().await?;
        **slot = Some(channel.clone());
        info!(channel_id = %self.config.id, "Channel created");
        Ok((channel, true))
    }

    /// Opens a channel on the current connection without storing it.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.connections.create_channel(&self.config).await
    }

    /// Drops the stored channel so the next [`get_channel`](Self::get_channel) reopens one.
    pub async fn invalidate(&self, slot: &mut ChannelSlot<'_>) {
        if let Some(channel) = slot.take() {
            if let Err(e) = channel.close().await {
                debug!(channel_id = %self.config.id, error = %e, "Closing discarded channel failed");
            }
        }
    }

    pub async fn close(&self) {
        let mut slot = self.lock().await;
        if let Some(channel) = slot.take() {
            if let Err(e) = channel.close().await {
                warn!(channel_id = %self.config.id, error = %e, "Failed to close channel");
            }
        }
    }

    /// Check if the channel is in a healthy state
    pub async fn is_healthy(&self) -> bool {
        match &*self.lock().await {
            Some(channel) => channel.is_open(),
            None => false,
        }
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}
