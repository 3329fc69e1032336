// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Failed to connect to RabbitMQ at {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },

    #[error("RabbitMQ session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Publish failed after {attempts} attempts: {source}")]
    PublishExhausted {
        attempts: u32,
        #[source]
        source: Box<RabbitMQError>,
    },

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Delivery {0} was already acknowledged or rejected")]
    AlreadySettled(u64),

    #[error("Connection manager is closed")]
    Closed,

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for failures that a later attempt on a fresh session may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::SessionUnavailable(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::PublishError(_)
                | RabbitMQError::ConsumeError(_)
                | RabbitMQError::TopologyError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // lapin does not expose a stable classification, so use the message text
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") {
            RabbitMQError::SessionUnavailable(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if lowered.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::ChannelError(error_text)
        }
    }
}
