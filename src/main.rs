use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbit_relay::env::Config;
use rabbit_relay::notifications::{LoggingNotifier, Notifier, TodoMessagesHandler, UsersMessagesHandler};
use rabbit_relay::rabbitmq::{ConnectionManager, ConsumerGroup, LapinBroker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .init();

    let connections = ConnectionManager::connect_with_delay(
        Arc::new(LapinBroker::new()),
        config.endpoint(),
        config.reconnect_delay(),
    )
    .await
    .context("connecting to RabbitMQ")?;

    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);
    let consumers = ConsumerGroup::new(connections.clone(), config.consumer_config());
    consumers.register_handler(
        config.users_queue.as_str(),
        config.users_exchange.as_str(),
        Arc::new(UsersMessagesHandler::new(notifier.clone())),
    )?;
    consumers.register_handler(
        config.todo_queue.as_str(),
        config.todo_exchange.as_str(),
        Arc::new(TodoMessagesHandler::new(notifier)),
    )?;

    let started = consumers.run();
    info!(consumers = started, "Notifications service started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    consumers.shutdown().await;
    connections.close().await.context("closing RabbitMQ connection")?;
    Ok(())
}
