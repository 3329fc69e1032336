// src/rabbitmq/mod.rs
// Connection management, publishing and consuming on top of a broker seam

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod endpoint;
pub mod errors;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod topology;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{Broker, BrokerChannel, BrokerConnection, CloseReason, LapinBroker};
pub use channel_manager::{ChannelConfig, ChannelManager};
pub use connection::{ConnectionManager, ConnectionState, DEFAULT_RECONNECT_DELAY};
pub use consumer::{ConsumerConfig, ConsumerGroup, FailurePolicy, Handler, HandlerBinding};
pub use delivery::{AckHandle, Delivery};
pub use endpoint::BrokerEndpoint;
pub use errors::{RabbitMQError, Result};
pub use memory::MemoryBroker;
pub use message::{OutboundMessage, REQUEST_ID_HEADER};
pub use publisher::{retry_backoff, Publisher, PublisherConfig, DEFAULT_MAX_RETRY_ATTEMPT};
pub use topology::Topology;
