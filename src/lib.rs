pub mod env;
pub mod notifications;
pub mod rabbitmq;
