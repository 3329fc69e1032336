use std::env;
use std::time::Duration;

use dotenv::dotenv;

use crate::rabbitmq::{
    BrokerEndpoint, ConsumerConfig, PublisherConfig, RabbitMQError, Result,
    DEFAULT_MAX_RETRY_ATTEMPT,
};

/// Settings read from `RABBITMQ_*` and `LOG_LEVEL`; each field is named after its variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub rabbitmq_user: String,
    pub rabbitmq_password: String,
    pub rabbitmq_host: String,
    pub rabbitmq_port: u16,
    pub rabbitmq_vhost: String,
    pub rabbitmq_max_retry_attempt: u32,
    pub rabbitmq_reconnect_timeout_seconds: u64,
    pub rabbitmq_prefetch_count: u16,
    pub users_exchange: String,
    pub users_queue: String,
    pub todo_exchange: String,
    pub todo_queue: String,
    pub log_level: String,
}

fn default_reconnect_timeout_seconds() -> u64 {
    10
}

// 0 leaves the broker's prefetch unlimited
fn default_prefetch_count() -> u16 {
    0
}

pub const MAX_RECONNECT_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;

impl Config {
    /// Reads `.env` if present, then the process environment.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            rabbitmq_user: text("RABBITMQ_USER", "user"),
            rabbitmq_password: text("RABBITMQ_PASSWORD", "user"),
            rabbitmq_host: text("RABBITMQ_HOST", "localhost"),
            rabbitmq_port: parse(&lookup, "RABBITMQ_PORT", 5672)?,
            rabbitmq_vhost: text("RABBITMQ_VHOST", "/"),
            rabbitmq_max_retry_attempt: parse(
                &lookup,
                "RABBITMQ_MAX_RETRY_ATTEMPT",
                DEFAULT_MAX_RETRY_ATTEMPT,
            )?,
            rabbitmq_reconnect_timeout_seconds: parse(
                &lookup,
                "RABBITMQ_RECONNECT_TIMEOUT_SECONDS",
                default_reconnect_timeout_seconds(),
            )?,
            rabbitmq_prefetch_count: parse(
                &lookup,
                "RABBITMQ_PREFETCH_COUNT",
                default_prefetch_count(),
            )?,
            users_exchange: text("RABBITMQ_USERS_EXCHANGE", "users.exchange"),
            users_queue: text("RABBITMQ_USERS_QUEUE", "users.queue"),
            todo_exchange: text("RABBITMQ_TODO_EXCHANGE", "todo.exchange"),
            todo_queue: text("RABBITMQ_TODO_QUEUE", "todo.queue"),
            log_level: text("LOG_LEVEL", "info"),
        };

        if config.rabbitmq_reconnect_timeout_seconds > MAX_RECONNECT_TIMEOUT_SECONDS {
            return Err(RabbitMQError::ConfigError(format!(
                "RABBITMQ_RECONNECT_TIMEOUT_SECONDS must be at most {}",
                MAX_RECONNECT_TIMEOUT_SECONDS
            )));
        }
        if config.rabbitmq_max_retry_attempt == 0 {
            return Err(RabbitMQError::ConfigError(
                "RABBITMQ_MAX_RETRY_ATTEMPT must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(
            self.rabbitmq_user.as_str(),
            self.rabbitmq_password.as_str(),
            self.rabbitmq_host.as_str(),
            self.rabbitmq_port,
        )
        .with_vhost(self.rabbitmq_vhost.as_str())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.rabbitmq_reconnect_timeout_seconds)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            restart_delay: self.reconnect_delay(),
            prefetch_count: self.rabbitmq_prefetch_count,
            ..ConsumerConfig::default()
        }
    }

    pub fn users_publisher(&self) -> PublisherConfig {
        PublisherConfig::new(self.users_exchange.as_str(), self.users_queue.as_str())
            .with_max_retry_attempt(self.rabbitmq_max_retry_attempt)
    }

    pub fn todo_publisher(&self) -> PublisherConfig {
        PublisherConfig::new(self.todo_exchange.as_str(), self.todo_queue.as_str())
            .with_max_retry_attempt(self.rabbitmq_max_retry_attempt)
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e| RabbitMQError::ConfigError(format!("{}={:?}: {}", key, val, e))),
        None => Ok(default),
    }
}
