use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use rabbit_relay::rabbitmq::{
    ChannelConfig, ConnectionManager, ConnectionState, MemoryBroker, RabbitMQError,
};

use crate::common::{connect, endpoint, wait_until, RECONNECT_DELAY};

#[tokio::test(start_paused = true)]
async fn unreachable_broker_fails_startup_without_retrying() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);

    let result =
        ConnectionManager::connect_with_delay(Arc::new(broker.clone()), endpoint(), RECONNECT_DELAY)
            .await;

    assert!(matches!(result, Err(RabbitMQError::Dial { .. })));
    sleep(RECONNECT_DELAY * 5).await;
    assert_eq!(broker.stats().dial_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_fail_startup() {
    let broker = MemoryBroker::new().with_credentials("user", "other");

    let result =
        ConnectionManager::connect_with_delay(Arc::new(broker.clone()), endpoint(), RECONNECT_DELAY)
            .await;

    match result {
        Err(RabbitMQError::Dial { reason, .. }) => assert!(reason.contains("ACCESS_REFUSED")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("dial should have been refused"),
    }
}

#[tokio::test(start_paused = true)]
async fn connects_and_opens_channels() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    assert_eq!(connections.state(), ConnectionState::Connected);
    assert!(connections.create_channel(&ChannelConfig::default()).await.is_ok());
    assert_eq!(broker.live_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn readers_see_session_unavailable_while_reconnecting() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    broker.set_reachable(false);
    broker.sever_connections("CONNECTION_FORCED - broker restart");
    assert!(connections.wait_for_state(ConnectionState::Reconnecting).await);

    let err = connections.connection().err().unwrap();
    assert!(matches!(err, RabbitMQError::SessionUnavailable(_)));
    assert!(err.is_transient());

    broker.set_reachable(true);
    let reconnected = timeout(
        RECONNECT_DELAY * 2,
        connections.wait_for_state(ConnectionState::Connected),
    )
    .await;
    assert_eq!(reconnected, Ok(true));
    assert_eq!(connections.reconnect_count(), 1);
    assert!(connections.connection().is_ok());
}

#[tokio::test(start_paused = true)]
async fn every_outage_is_recovered_within_one_delay() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let start = Instant::now();
    let outages: u32 = 3;

    for outage in 1..=outages {
        broker.set_reachable(false);
        broker.sever_connections("CONNECTION_FORCED");
        sleep(RECONNECT_DELAY / 2).await;
        broker.set_reachable(true);

        let expected = u64::from(outage);
        assert!(
            wait_until(RECONNECT_DELAY, || connections.reconnect_count() == expected).await,
            "outage {} not recovered",
            outage
        );
        assert_eq!(connections.state(), ConnectionState::Connected);
    }

    // each outage costs one failed dial plus one delay, with polling slack
    let slack = Duration::from_millis(100) * outages;
    assert!(start.elapsed() <= RECONNECT_DELAY * outages + slack);
    assert_eq!(broker.live_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_retrying_until_the_broker_returns() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    broker.set_reachable(false);
    broker.sever_connections("CONNECTION_FORCED");
    sleep(RECONNECT_DELAY * 6 + RECONNECT_DELAY / 2).await;

    // initial dial plus one attempt per elapsed delay
    assert_eq!(broker.stats().dial_attempts, 1 + 7);
    assert_eq!(connections.state(), ConnectionState::Reconnecting);

    broker.set_reachable(true);
    assert!(wait_until(RECONNECT_DELAY, || connections.reconnect_count() == 1).await);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    connections.close().await.unwrap();
    connections.close().await.unwrap();

    assert!(connections.is_closed());
    assert_eq!(connections.state(), ConnectionState::Closed);
    assert_eq!(broker.live_connections(), 0);
    assert!(matches!(connections.connection(), Err(RabbitMQError::Closed)));
    assert!(!connections.wait_for_state(ConnectionState::Connected).await);
}

#[tokio::test(start_paused = true)]
async fn close_interrupts_a_pending_reconnect() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    broker.set_reachable(false);
    broker.sever_connections("CONNECTION_FORCED");
    assert!(connections.wait_for_state(ConnectionState::Reconnecting).await);

    connections.close().await.unwrap();
    let dials = broker.stats().dial_attempts;

    broker.set_reachable(true);
    sleep(RECONNECT_DELAY * 5).await;

    assert_eq!(broker.stats().dial_attempts, dials);
    assert_eq!(connections.state(), ConnectionState::Closed);
    assert_eq!(broker.live_connections(), 0);
}
