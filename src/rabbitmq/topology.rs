use super::errors::{RabbitMQError, Result};

/// Exchange/queue/binding triple a component depends on.
///
/// Always declared as a durable topic exchange plus a durable, non-exclusive,
/// non-auto-delete queue. Declaring it again with the same values is a no-op on
/// the broker, which is what makes redeclaration safe after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    /// Binds `queue` to `exchange` using the queue name as routing key.
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            exchange: exchange.into(),
            routing_key: queue.clone(),
            queue,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.is_empty() {
            return Err(RabbitMQError::TopologyError("exchange name is empty".into()));
        }
        if self.queue.is_empty() {
            return Err(RabbitMQError::TopologyError("queue name is empty".into()));
        }
        Ok(())
    }
}
