use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::errors::{RabbitMQError, Result};
use super::message::REQUEST_ID_HEADER;

/// Broker-side settlement of one delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One inbound message plus its acknowledgment obligation.
///
/// `ack` and `nack` each settle the delivery; only the first settle call reaches
/// the broker, later ones fail with [`RabbitMQError::AlreadySettled`].
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    acker: Box<dyn AckHandle>,
    settled: AtomicBool,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, acker: Box<dyn AckHandle>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            content_type: None,
            headers: BTreeMap::new(),
            body,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    pub fn with_routing(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.acker.nack(requeue).await
    }

    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(RabbitMQError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}
