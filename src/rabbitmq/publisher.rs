use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::channel_manager::{ChannelConfig, ChannelManager};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::message::OutboundMessage;
use super::topology::Topology;

pub const DEFAULT_MAX_RETRY_ATTEMPT: u32 = 5;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topology: Topology,
    pub max_retry_attempt: u32,
    pub channel: ChannelConfig,
}

impl PublisherConfig {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            topology: Topology::new(exchange, queue),
            max_retry_attempt: DEFAULT_MAX_RETRY_ATTEMPT,
            channel: ChannelConfig::default().with_id("publisher"),
        }
    }

    pub fn with_max_retry_attempt(mut self, attempts: u32) -> Self {
        self.max_retry_attempt = attempts;
        self
    }
}

/// Delay slept after failed attempt `attempt` (1-based): `attempt²` seconds.
pub fn retry_backoff(attempt: u32) -> Duration {
    let attempt = u64::from(attempt);
    Duration::from_secs(attempt.saturating_mul(attempt))
}

/// Publishes to one exchange/routing key with bounded retries.
///
/// Topology management and publishing use separate channels. The publishing
/// channel is shared by all callers and only one publish runs on it at a time.
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    topology: Topology,
    max_retry_attempt: u32,
    session: ChannelManager,
}

impl Publisher {
    /// Declares the topology on a short-lived service channel, then opens the
    /// publishing channel.
    pub async fn new(connections: Arc<ConnectionManager>, config: PublisherConfig) -> Result<Self> {
        config.topology.validate()?;
        if config.max_retry_attempt == 0 {
            return Err(RabbitMQError::ConfigError(
                "max_retry_attempt must be at least 1".into(),
            ));
        }

        let service_config = ChannelConfig {
            confirm_mode: false,
            prefetch_count: 0,
            id: format!("{}-service", config.channel.id),
        };
        let service = connections.create_channel(&service_config).await?;
        let declared = service.declare_topology(&config.topology).await;
        if let Err(e) = service.close().await {
            debug!(error = %e, "Closing service channel failed");
        }
        declared?;

        let session = ChannelManager::new(connections.clone(), config.channel);
        {
            let mut slot = session.lock().await;
            session.get_channel(&mut slot).await?;
        }

        info!(
            exchange = %config.topology.exchange,
            queue = %config.topology.queue,
            "Publisher ready"
        );

        Ok(Self {
            connections,
            topology: config.topology,
            max_retry_attempt: config.max_retry_attempt,
            session,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn publish(&self, payload: &[u8]) -> Result<()> {
        self.publish_with_request_id(payload, None).await
    }

    pub async fn publish_json<T: Serialize>(&self, value: &T, request_id: Option<&str>) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_with_request_id(&payload, request_id).await
    }

    /// Tries up to `max_retry_attempt` times, sleeping `attempt²` seconds
    /// between failures, and returns the last error once attempts run out.
    pub async fn publish_with_request_id(
        &self,
        payload: &[u8],
        request_id: Option<&str>,
    ) -> Result<()> {
        let message = OutboundMessage::json(
            self.topology.exchange.as_str(),
            self.topology.routing_key.as_str(),
            payload,
        )
        .with_request_id(request_id);

        let mut last_error = None;
        for attempt in 1..=self.max_retry_attempt {
            match self.try_publish(&message).await {
                Ok(()) => {
                    debug!(
                        attempt,
                        exchange = %message.exchange,
                        routing_key = %message.routing_key,
                        request_id = request_id.unwrap_or_default(),
                        "Published message"
                    );
                    return Ok(());
                }
                Err(RabbitMQError::Closed) => return Err(RabbitMQError::Closed),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_retry_attempt,
                        exchange = %message.exchange,
                        request_id = request_id.unwrap_or_default(),
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.max_retry_attempt {
                        sleep(retry_backoff(attempt)).await;
                    }
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| RabbitMQError::PublishError("no publish attempt was made".into()));
        Err(RabbitMQError::PublishExhausted {
            attempts: self.max_retry_attempt,
            source: Box::new(source),
        })
    }

    async fn try_publish(&self, message: &OutboundMessage) -> Result<()> {
        if self.connections.is_closed() {
            return Err(RabbitMQError::Closed);
        }

        let mut slot = self.session.lock().await;
        let (channel, fresh) = self.session.get_channel(&mut slot).await?;
        if fresh {
            // A new channel usually means a new connection; redeclare before use.
            if let Err(e) = channel.declare_topology(&self.topology).await {
                self.session.invalidate(&mut slot).await;
                return Err(e);
            }
        }

        if let Err(e) = channel.publish(message).await {
            self.session.invalidate(&mut slot).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}
