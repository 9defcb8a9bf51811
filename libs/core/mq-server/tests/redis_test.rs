//! Redis integration tests
//!
//! Runs the server against a real Redis (testcontainers). The server API is
//! blocking, so each test drives it from `spawn_blocking`.

#![cfg(feature = "redis")]

mod common;

use common::*;
use mq_server::{
    HandlerError, Message, MessageBroker, MqServer, RedisBroker, RetryConfig, WorkerStatus,
};
use std::sync::Arc;
use test_utils::{wait_until, TestDataBuilder, TestRedis};

fn redis_broker(redis: &TestRedis) -> Arc<RedisBroker> {
    let retry = RetryConfig::new().with_max_retries(3);
    Arc::new(RedisBroker::connect_with_retry(redis.connection_string(), Some(retry)).unwrap())
}

#[tokio::test]
async fn test_reverse_scenario_over_redis() {
    let redis = TestRedis::new().await;
    let broker = redis_broker(&redis);
    let builder = TestDataBuilder::from_test_name("test_reverse_scenario_over_redis");
    let config = test_config()
        .with_queue_prefix(builder.queue_prefix())
        .with_control_topic(builder.control_topic());
    let out_q = format!("{}Reverse.outq", builder.queue_prefix());

    tokio::task::spawn_blocking(move || {
        let server = MqServer::new(broker, config);
        server.register_handler(reverse_handler).unwrap();
        let client = server.client();

        client.publish(reverse("Hello")).unwrap();
        client.publish(reverse("World")).unwrap();
        server.start().unwrap();

        assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 2));

        let first = client.get::<ReverseResponse>(&out_q).unwrap().unwrap();
        let second = client.get::<ReverseResponse>(&out_q).unwrap().unwrap();
        assert_eq!(first.body.value, "olleH");
        assert_eq!(second.body.value, "dlroW");

        server.stop().unwrap();
        assert!(wait_until(TIMEOUT, || server.status() == WorkerStatus::Stopped));
        server.dispose();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_retry_to_dlq_over_redis() {
    let redis = TestRedis::new().await;
    let broker = redis_broker(&redis);
    let builder = TestDataBuilder::from_test_name("test_retry_to_dlq_over_redis");
    let config = test_config()
        .with_retry_count(1)
        .with_queue_prefix(builder.queue_prefix())
        .with_control_topic(builder.control_topic());
    let dlq = format!("{}Reverse.dlq", builder.queue_prefix());
    let out_q = format!("{}Reverse.outq", builder.queue_prefix());

    tokio::task::spawn_blocking(move || {
        let server = MqServer::new(broker.clone(), config);
        server
            .register_handler(
                |_msg: &Message<Reverse>| -> Result<Option<ReverseResponse>, HandlerError> {
                    Err(HandlerError::new("boom"))
                },
            )
            .unwrap();
        server.start().unwrap();
        assert!(wait_until(TIMEOUT, || server.is_subscribed()));

        server.client().publish(reverse("doomed")).unwrap();

        assert!(wait_until(TIMEOUT, || broker.queue_len(&dlq).unwrap() == 1));
        assert_eq!(broker.queue_len(&out_q).unwrap(), 0);
        assert_eq!(server.stats().total_messages_failed, 2);

        server.dispose();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_failover_resubscribes_over_redis() {
    let redis = TestRedis::new().await;
    let broker = redis_broker(&redis);
    let builder = TestDataBuilder::from_test_name("test_failover_resubscribes_over_redis");
    let config = test_config()
        .with_queue_prefix(builder.queue_prefix())
        .with_control_topic(builder.control_topic());

    tokio::task::spawn_blocking(move || {
        let server = MqServer::new(broker.clone(), config);
        server.register_handler(reverse_handler).unwrap();
        server.start().unwrap();
        assert!(wait_until(TIMEOUT, || server.is_subscribed()));

        broker.failover();

        // still serving after the reset
        server.client().publish(reverse("abc")).unwrap();
        assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 1));
        assert_eq!(server.status(), WorkerStatus::Started);
        assert_eq!(server.no_of_errors(), 0);

        server.dispose();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_queue_commands_reuse_pooled_connections() {
    let redis = TestRedis::new().await;
    let broker = redis_broker(&redis);
    let builder = TestDataBuilder::from_test_name("test_queue_commands_reuse_pooled_connections");
    let queue = format!("{}Reverse.inq", builder.queue_prefix());

    tokio::task::spawn_blocking(move || {
        for i in 0..50 {
            broker.publish(&queue, format!("{}", i).as_bytes()).unwrap();
        }
        assert_eq!(broker.queue_len(&queue).unwrap(), 50);
        while broker.get(&queue).unwrap().is_some() {}

        // Sequential commands keep checking the same connection back in
        assert_eq!(broker.pooled_connections(), 1);
    })
    .await
    .unwrap();
}
