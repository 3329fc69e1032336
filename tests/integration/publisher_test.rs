use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{sleep, Instant};

use rabbit_relay::rabbitmq::{
    retry_backoff, ConnectionState, Publisher, PublisherConfig, RabbitMQError,
    DEFAULT_MAX_RETRY_ATTEMPT, REQUEST_ID_HEADER,
};
use rabbit_relay::rabbitmq::MemoryBroker;

use crate::common::{connect, publisher, RECONNECT_DELAY};

#[tokio::test(start_paused = true)]
async fn publish_records_one_persistent_json_message() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = publisher(&connections, "todo.exchange", "todo.queue").await;

    publisher.publish(b"{\"a\":1}").await.unwrap();

    let messages = broker.ready_messages("todo.queue");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, b"{\"a\":1}".to_vec());
    assert!(messages[0].persistent);
    assert_eq!(messages[0].content_type, "application/json");
    assert_eq!(messages[0].exchange, "todo.exchange");
    assert_eq!(messages[0].routing_key, "todo.queue");
}

#[tokio::test(start_paused = true)]
async fn request_id_travels_in_headers() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = publisher(&connections, "users.exchange", "users.queue").await;

    publisher
        .publish_with_request_id(b"{}", Some("req-7"))
        .await
        .unwrap();
    publisher
        .publish_json(&serde_json::json!({"link": "https://x/verify"}), None)
        .await
        .unwrap();

    let messages = broker.ready_messages("users.queue");
    assert_eq!(
        messages[0].headers.get(REQUEST_ID_HEADER).map(String::as_str),
        Some("req-7")
    );
    assert!(messages[1].headers.get(REQUEST_ID_HEADER).is_none());
    let body: serde_json::Value = serde_json::from_slice(&messages[1].body).unwrap();
    assert_eq!(body["link"], "https://x/verify");
}

#[tokio::test(start_paused = true)]
async fn permanently_failing_publish_stops_after_max_attempts() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = publisher(&connections, "todo.exchange", "todo.queue").await;
    broker.set_fail_publishes(true);

    let before = broker.stats().publish_attempts;
    let start = Instant::now();
    let err = publisher.publish(b"{}").await.unwrap_err();

    match err {
        RabbitMQError::PublishExhausted { attempts, source } => {
            assert_eq!(attempts, DEFAULT_MAX_RETRY_ATTEMPT);
            assert!(matches!(*source, RabbitMQError::PublishError(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(
        broker.stats().publish_attempts - before,
        DEFAULT_MAX_RETRY_ATTEMPT as usize
    );

    // 1 + 4 + 9 + 16 seconds between five attempts, none after the last
    let slept: Duration = (1..DEFAULT_MAX_RETRY_ATTEMPT).map(retry_backoff).sum();
    assert_eq!(slept, Duration::from_secs(30));
    assert!(start.elapsed() >= slept);
    assert!(start.elapsed() < slept + Duration::from_secs(1));
    assert!(broker.ready_messages("todo.queue").is_empty());
}

#[tokio::test(start_paused = true)]
async fn configured_attempt_count_is_honoured() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = Publisher::new(
        connections.clone(),
        PublisherConfig::new("todo.exchange", "todo.queue").with_max_retry_attempt(2),
    )
    .await
    .unwrap();
    broker.set_fail_publishes(true);

    let before = broker.stats().publish_attempts;
    let err = publisher.publish(b"{}").await.unwrap_err();

    assert!(matches!(err, RabbitMQError::PublishExhausted { attempts: 2, .. }));
    assert_eq!(broker.stats().publish_attempts - before, 2);
}

#[tokio::test(start_paused = true)]
async fn zero_attempts_is_a_config_error() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    let result = Publisher::new(
        connections,
        PublisherConfig::new("todo.exchange", "todo.queue").with_max_retry_attempt(0),
    )
    .await;

    assert!(matches!(result, Err(RabbitMQError::ConfigError(_))));
}

#[tokio::test(start_paused = true)]
async fn redeclaring_topology_changes_nothing() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;

    let first = publisher(&connections, "todo.exchange", "todo.queue").await;
    first.publish(b"1").await.unwrap();
    let bindings = broker.bindings("todo.exchange");

    let second = publisher(&connections, "todo.exchange", "todo.queue").await;
    second.publish(b"2").await.unwrap();

    assert_eq!(broker.bindings("todo.exchange"), bindings);
    assert_eq!(
        bindings,
        vec![("todo.queue".to_string(), "todo.queue".to_string())]
    );
    let bodies: Vec<Vec<u8>> = broker
        .ready_messages("todo.queue")
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn publish_uses_a_fresh_channel_after_the_connection_drops() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = publisher(&connections, "todo.exchange", "todo.queue").await;
    publisher.publish(b"before").await.unwrap();
    let channels_before = broker.stats().channels_opened;

    broker.sever_connections("CONNECTION_FORCED");
    publisher.publish(b"after").await.unwrap();

    assert!(broker.stats().channels_opened > channels_before);
    assert_eq!(connections.reconnect_count(), 1);
    assert_eq!(broker.ready_messages("todo.queue").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn publish_outlasts_an_outage_shorter_than_its_retry_window() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = Arc::new(publisher(&connections, "todo.exchange", "todo.queue").await);

    broker.set_reachable(false);
    broker.sever_connections("CONNECTION_FORCED");

    let pending = tokio::spawn({
        let publisher = publisher.clone();
        async move { publisher.publish(b"queued").await }
    });

    sleep(RECONNECT_DELAY / 2).await;
    broker.set_reachable(true);

    pending.await.unwrap().unwrap();
    assert_eq!(connections.state(), ConnectionState::Connected);
    assert_eq!(broker.ready_messages("todo.queue").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_publishes_never_share_the_channel_at_once() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = Arc::new(publisher(&connections, "todo.exchange", "todo.queue").await);

    let tasks = (0..16).map(|i| {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.publish(format!("{}", i).as_bytes()).await })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(broker.stats().max_concurrent_publishes, 1);
    assert_eq!(broker.ready_messages("todo.queue").len(), 16);
}

#[tokio::test(start_paused = true)]
async fn publish_after_close_fails_immediately() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = publisher(&connections, "todo.exchange", "todo.queue").await;

    connections.close().await.unwrap();
    let start = Instant::now();
    let err = publisher.publish(b"{}").await.unwrap_err();

    assert!(matches!(err, RabbitMQError::Closed));
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn publisher_close_releases_its_channel() {
    let broker = MemoryBroker::new();
    let connections = connect(&broker).await;
    let publisher = publisher(&connections, "todo.exchange", "todo.queue").await;

    publisher.close().await;
    // next publish opens a new channel on the same connection
    let opened = broker.stats().channels_opened;
    publisher.publish(b"{}").await.unwrap();
    assert_eq!(broker.stats().channels_opened, opened + 1);
}
