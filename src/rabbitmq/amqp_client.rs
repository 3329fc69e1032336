// src/rabbitmq/amqp_client.rs
//! Broker seam: the three traits the connection manager, publisher and
//! consumer group are written against, plus the `lapin` implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::channel_manager::ChannelConfig;
use super::delivery::{AckHandle, Delivery};
use super::endpoint::BrokerEndpoint;
use super::errors::{RabbitMQError, Result};
use super::message::OutboundMessage;
use super::topology::Topology;

/// Why a connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this process.
    Local,
    /// Closed by the broker or by a transport failure.
    Remote(String),
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Dials broker connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>>;
}

/// One physical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolves once the connection is closed, from either side.
    async fn closed(&self) -> CloseReason;

    async fn close(&self) -> Result<()>;
}

/// A multiplexed session over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_topology(&self, topology: &Topology) -> Result<()>;

    async fn publish(&self, message: &OutboundMessage) -> Result<()>;

    /// Opens a manual-acknowledgment delivery stream on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// [`Broker`] backed by a real RabbitMQ server.
#[derive(Debug, Default, Clone)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>> {
        debug!(endpoint = %endpoint, "Dialing RabbitMQ");
        let connection = Connection::connect(&endpoint.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::Dial {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let remote = tx.clone();
        connection.on_error(move |err| {
            remote.send_replace(Some(CloseReason::Remote(err.to_string())));
        });

        Ok(Arc::new(LapinConnection {
            connection,
            closed_tx: tx,
            closed_rx: rx,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>> {
        if !self.connection.status().connected() {
            return Err(RabbitMQError::SessionUnavailable(
                "connection is not connected".into(),
            ));
        }

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;

        if config.prefetch_count > 0 {
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        if config.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        debug!(channel_id = %config.id, "Channel created and configured");
        Ok(Arc::new(LapinChannel {
            channel,
            confirm_mode: config.confirm_mode,
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
        self.closed_tx.send_replace(Some(CloseReason::Local));
        if self.connection.status().connected() {
            self.connection
                .close(200, "Closing connection")
                .await
                .map_err(|e| RabbitMQError::SessionUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
    confirm_mode: bool,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;

        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "declare exchange {}: {}",
                    topology.exchange, e
                ))
            })?;

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("declare queue {}: {}", topology.queue, e))
            })?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "bind queue {} to {}: {}",
                    topology.queue, topology.exchange, e
                ))
            })?;

        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let mut headers = FieldTable::default();
        for (key, value) in &message.headers {
            headers.insert(
                key.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            );
        }

        let mut properties = BasicProperties::default()
            .with_content_type(message.content_type.as_str().into())
            .with_message_id(message.message_id.to_string().into())
            .with_timestamp(message.timestamp.timestamp() as u64)
            .with_headers(headers);
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if !self.confirm_mode {
            return Ok(());
        }

        match confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
        {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(returned)) => Err(RabbitMQError::PublishError(format!(
                "message returned as unroutable: {}",
                returned.reply_text.as_str()
            ))),
            Confirmation::Nack(_) => Err(RabbitMQError::PublishError(
                "broker negatively acknowledged the message".into(),
            )),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(into_delivery)
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl AckHandle for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            match header_text(value) {
                Some(text) => {
                    headers.insert(key.as_str().to_owned(), text);
                }
                None => warn!(header = %key.as_str(), "Skipping non-text message header"),
            }
        }
    }
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_owned());

    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        Box::new(LapinAcker(delivery.acker)),
    )
    .with_routing(delivery.exchange.as_str(), delivery.routing_key.as_str())
    .with_redelivered(delivery.redelivered)
    .with_content_type(content_type)
    .with_headers(headers)
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}
