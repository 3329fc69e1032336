use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Header carrying the originating caller's request id end to end.
pub const REQUEST_ID_HEADER: &str = "requestId";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message on its way to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    /// Survive a broker restart (AMQP delivery mode 2).
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Persistent JSON message, the only kind the publisher sends.
    pub fn json(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            headers: BTreeMap::new(),
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_request_id(self, request_id: Option<&str>) -> Self {
        match request_id {
            Some(id) => self.with_header(REQUEST_ID_HEADER, id),
            None => self,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).map(String::as_str)
    }
}
