//! Message dispatch tests for MqServer
//!
//! These tests publish through `MqClient` and observe queues and stats:
//! - Responses land on the Out queue or `reply_to`
//! - Failures retry `retry_count` times, then dead-letter
//! - Backlog published before `start()` is drained
//! - `thread_count` workers share one inbox
//! - Null responses follow the publishing setting
//! - Priority routing, publish whitelists and filters follow the config

mod common;

use common::*;
use mq_server::{DlqManager, ErrorCallback, HandlerError, Message, MqServer, MqServerConfig};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use test_utils::wait_until;

#[test]
fn test_reverse_scenario() {
    let broker = TestBroker::new();
    let server = reverse_server(broker.clone(), test_config());
    let client = server.client();

    client.publish(reverse("Hello")).unwrap();
    client.publish(reverse("World")).unwrap();
    server.start().unwrap();

    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 2));

    let first = client.get::<ReverseResponse>("mq:Reverse.outq").unwrap().unwrap();
    let second = client.get::<ReverseResponse>("mq:Reverse.outq").unwrap().unwrap();
    assert_eq!(first.body.value, "olleH");
    assert_eq!(second.body.value, "dlroW");
    assert!(first.reply_id.is_some());

    server.dispose();
}

#[test]
fn test_reply_to_receives_response() {
    let broker = TestBroker::new();
    let server = reverse_server(broker.clone(), test_config());
    let client = server.client();
    server.start().unwrap();
    assert!(wait_until(TIMEOUT, || server.is_subscribed()));

    let request = Message::new(reverse("abc")).with_reply_to("mq:client-1.inbox");
    client.publish_message(&request).unwrap();

    assert!(wait_until(TIMEOUT, || client.queue_len("mq:client-1.inbox").unwrap() == 1));
    let response = client
        .get::<ReverseResponse>("mq:client-1.inbox")
        .unwrap()
        .unwrap();
    assert_eq!(response.body.value, "cba");
    assert_eq!(response.reply_id, Some(request.id));
    assert_eq!(client.queue_len("mq:Reverse.outq").unwrap(), 0);

    server.dispose();
}

#[test]
fn test_always_failing_handler_dead_letters_after_retries() {
    let broker = TestBroker::new();
    let server = MqServer::new(broker.clone(), test_config().with_retry_count(2));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        server
            .register_handler(
                move |_msg: &Message<Reverse>| -> Result<Option<ReverseResponse>, HandlerError> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("always fails"))
                },
            )
            .unwrap();
    }

    let client = server.client();
    server.start().unwrap();
    assert!(wait_until(TIMEOUT, || server.is_subscribed()));
    client.publish(reverse("doomed")).unwrap();

    assert!(wait_until(TIMEOUT, || client.queue_len("mq:Reverse.dlq").unwrap() == 1));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.queue_len("mq:Reverse.dlq").unwrap(), 1);
    assert_eq!(client.queue_len("mq:Reverse.outq").unwrap(), 0);
    assert_eq!(client.queue_len("mq:Reverse.inq").unwrap(), 0);

    let dead = client.get_response("mq:Reverse.dlq").unwrap().unwrap();
    assert_eq!(dead.retry_attempts, 3);
    assert_eq!(dead.error.unwrap().message, "always fails");
    assert_eq!(dead.body["value"], "doomed");

    let stats = server.stats();
    assert_eq!(stats.total_messages_failed, 3);
    assert_eq!(stats.total_retries, 2);

    server.dispose();
}

#[test]
fn test_error_callback_and_reprocess_from_dlq() {
    let broker = TestBroker::new();
    let server = MqServer::new(broker.clone(), test_config().with_retry_count(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    {
        let healthy = Arc::clone(&healthy);
        let failures = Arc::clone(&failures);
        let on_error: Arc<ErrorCallback<Reverse>> =
            Arc::new(move |_msg: &Message<Reverse>, _err: &HandlerError| {
                failures.fetch_add(1, Ordering::SeqCst);
            });
        server
            .register_handler_with(
                move |msg: &Message<Reverse>| -> Result<Option<ReverseResponse>, HandlerError> {
                    if healthy.load(Ordering::SeqCst) {
                        reverse_handler(msg)
                    } else {
                        Err(HandlerError::new("downstream unavailable"))
                    }
                },
                Some(on_error),
                1,
            )
            .unwrap();
    }

    let client = server.client();
    server.start().unwrap();
    assert!(wait_until(TIMEOUT, || server.is_subscribed()));
    client.publish(reverse("later")).unwrap();

    assert!(wait_until(TIMEOUT, || client.queue_len("mq:Reverse.dlq").unwrap() == 1));
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    healthy.store(true, Ordering::SeqCst);
    let dlq = DlqManager::new(server.broker(), server.config());
    assert_eq!(dlq.reprocess("Reverse", 10).unwrap().reprocessed, 1);

    assert!(wait_until(TIMEOUT, || client.queue_len("mq:Reverse.outq").unwrap() == 1));
    let response = client.get::<ReverseResponse>("mq:Reverse.outq").unwrap().unwrap();
    assert_eq!(response.body.value, "retal");

    server.dispose();
}

#[test]
fn test_backlog_published_before_start_is_drained() {
    let broker = TestBroker::new();
    let server = reverse_server(broker.clone(), test_config());
    let client = server.client();

    for i in 0..5 {
        client.publish(reverse(&format!("msg-{}", i))).unwrap();
    }
    assert_eq!(client.queue_len("mq:Reverse.inq").unwrap(), 5);

    server.start().unwrap();

    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 5));
    assert_eq!(client.queue_len("mq:Reverse.inq").unwrap(), 0);
    assert_eq!(client.queue_len("mq:Reverse.outq").unwrap(), 5);

    server.dispose();
}

#[test]
fn test_thread_count_fans_out_over_one_inbox() {
    const HANDLER_TIME: Duration = Duration::from_millis(200);

    let broker = TestBroker::new();
    let server = MqServer::new(broker.clone(), test_config());
    server
        .register_handler_with(
            |msg: &Message<Reverse>| -> Result<Option<ReverseResponse>, HandlerError> {
                thread::sleep(HANDLER_TIME);
                reverse_handler(msg)
            },
            None,
            3,
        )
        .unwrap();
    server.init().unwrap();

    let inbox_workers = server.workers_for("mq:Reverse.inq");
    assert_eq!(inbox_workers.len(), 3);
    let ids: HashSet<u64> = inbox_workers.iter().map(|w| w.id()).collect();
    assert_eq!(ids.len(), 3);

    let client = server.client();
    server.start().unwrap();
    assert!(wait_until(TIMEOUT, || server.is_subscribed()));

    let started = Instant::now();
    for i in 0..6 {
        client.publish(reverse(&format!("slow-{}", i))).unwrap();
    }
    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 6));
    let elapsed = started.elapsed();

    // sequential processing would take 6 x 200ms
    assert!(
        elapsed < HANDLER_TIME * 5,
        "6 messages over 3 workers took {:?}",
        elapsed
    );

    server.dispose();
}

fn silent_server(broker: Arc<TestBroker>, config: MqServerConfig) -> MqServer {
    let server = MqServer::new(broker, config);
    server
        .register_handler(|_msg: &Message<Reverse>| -> Result<Option<ReverseResponse>, HandlerError> {
            Ok(None)
        })
        .unwrap();
    server
}

#[test]
fn test_null_response_publishes_marker_when_enabled() {
    let broker = TestBroker::new();
    let server = silent_server(broker.clone(), test_config());
    let client = server.client();

    let request = Message::new(reverse("quiet"));
    client.publish_message(&request).unwrap();
    server.start().unwrap();

    assert!(wait_until(TIMEOUT, || client.queue_len("mq:Reverse.outq").unwrap() == 1));
    let marker = client.get_response("mq:Reverse.outq").unwrap().unwrap();
    assert_eq!(marker.body, Value::Null);
    assert_eq!(marker.reply_id, Some(request.id));

    server.dispose();
}

#[test]
fn test_null_response_publishes_nothing_when_disabled() {
    let broker = TestBroker::new();
    let server = silent_server(
        broker.clone(),
        test_config().with_disable_publishing_responses(true),
    );
    let client = server.client();

    client
        .publish_message(&Message::new(reverse("quiet")).with_reply_to("mq:client-2.inbox"))
        .unwrap();
    server.start().unwrap();

    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.queue_len("mq:Reverse.outq").unwrap(), 0);
    assert_eq!(client.queue_len("mq:client-2.inbox").unwrap(), 0);

    server.dispose();
}

#[test]
fn test_priority_messages_use_priority_workers() {
    let broker = TestBroker::new();
    let server = reverse_server(broker.clone(), test_config());
    let client = server.client();
    server.start().unwrap();
    assert!(wait_until(TIMEOUT, || server.is_subscribed()));

    client
        .publish_message(&Message::new(reverse("urgent")).with_priority(5))
        .unwrap();

    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 1));
    let priority_worker = &server.workers_for("mq:Reverse.priorityq")[0];
    assert_eq!(priority_worker.stats().total_messages_processed, 1);
    assert_eq!(priority_worker.stats().total_priority_messages_received, 1);
    assert!(priority_worker.stats().total_notifications >= 1);

    server.dispose();
}

#[test]
fn test_priority_messages_without_priority_workers_are_processed() {
    let broker = TestBroker::new();
    let server = reverse_server(broker.clone(), test_config().disable_priority_queues());
    let client = server.client();
    server.start().unwrap();
    assert!(wait_until(TIMEOUT, || server.is_subscribed()));

    client
        .publish_message(&Message::new(reverse("urgent")).with_priority(1))
        .unwrap();

    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 1));
    assert!(server.workers_for("mq:Reverse.priorityq").is_empty());
    assert_eq!(client.queue_len("mq:Reverse.priorityq").unwrap(), 0);

    server.dispose();
}

#[test]
fn test_responses_whitelist_is_per_type() {
    let broker = TestBroker::new();
    let config = test_config().with_publish_responses_whitelist(["Hello"]);
    let server = reverse_server(broker.clone(), config);
    let client = server.client();

    client.publish(reverse("abc")).unwrap();
    server.start().unwrap();

    assert!(wait_until(TIMEOUT, || server.stats().total_messages_processed == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.queue_len("mq:Reverse.outq").unwrap(), 0);

    server.dispose();
}

#[test]
fn test_filters_apply_to_server_workers() {
    let broker = TestBroker::new();
    let config = test_config()
        .with_request_filter(|mut msg: Message<Value>| {
            msg.body["value"] = Value::from("filtered");
            Some(msg)
        })
        .with_response_filter(|mut body: Value| {
            body["filtered"] = Value::Bool(true);
            body
        });
    let server = reverse_server(broker.clone(), config);
    let client = server.client();

    client.publish(reverse("abc")).unwrap();
    server.start().unwrap();

    assert!(wait_until(TIMEOUT, || client.queue_len("mq:Reverse.outq").unwrap() == 1));
    let response = client.get_response("mq:Reverse.outq").unwrap().unwrap();
    assert_eq!(response.body["value"], "deretlif");
    assert_eq!(response.body["filtered"], true);

    server.dispose();
}
