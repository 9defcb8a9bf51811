//! Shared fixtures for the MQ server integration tests
#![allow(dead_code)]

use mq_server::{
    FailoverHook, HandlerError, InMemoryBroker, Message, MessageBroker, MqError, MqMessage,
    MqServer, MqServerConfig, ReclaimPolicy, SubscriptionControl, SubscriptionEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reverse {
    pub value: String,
}

impl MqMessage for Reverse {
    const TYPE_NAME: &'static str = "Reverse";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseResponse {
    pub value: String,
}

pub fn reverse(value: &str) -> Reverse {
    Reverse {
        value: value.to_string(),
    }
}

pub fn reverse_handler(msg: &Message<Reverse>) -> Result<Option<ReverseResponse>, HandlerError> {
    Ok(Some(ReverseResponse {
        value: msg.body.value.chars().rev().collect(),
    }))
}

/// Fast reclaim and keep-alive so lifecycle tests finish quickly
pub fn test_config() -> MqServerConfig {
    MqServerConfig::new()
        .with_keep_alive_retry_after(Some(Duration::from_millis(10)))
        .with_max_backoff(Duration::from_millis(50))
        .with_reclaim_policy(ReclaimPolicy {
            grace: Duration::from_millis(200),
            interrupt_timeout: Duration::from_millis(500),
        })
}

/// In-memory broker that counts subscriptions and can fail queue reads
#[derive(Default)]
pub struct TestBroker {
    pub inner: InMemoryBroker,
    pub subscribe_calls: AtomicUsize,
    failing_gets: Mutex<HashMap<String, usize>>,
}

impl TestBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `times` reads of `queue` fail
    pub fn fail_gets(&self, queue: &str, times: usize) {
        self.failing_gets
            .lock()
            .unwrap()
            .insert(queue.to_string(), times);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

impl MessageBroker for TestBroker {
    fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MqError> {
        self.inner.publish(queue, payload)
    }

    fn get(&self, queue: &str) -> Result<Option<Vec<u8>>, MqError> {
        if let Some(remaining) = self.failing_gets.lock().unwrap().get_mut(queue) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MqError::broker("connection reset by peer"));
            }
        }
        self.inner.get(queue)
    }

    fn notify(&self, topic: &str, payload: &str) -> Result<(), MqError> {
        self.inner.notify(topic, payload)
    }

    fn subscribe(
        &self,
        topic: &str,
        on_event: &mut dyn FnMut(SubscriptionEvent) -> SubscriptionControl,
    ) -> Result<(), MqError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(topic, on_event)
    }

    fn queue_len(&self, queue: &str) -> Result<usize, MqError> {
        self.inner.queue_len(queue)
    }

    fn on_failover(&self, hook: FailoverHook) {
        self.inner.on_failover(hook)
    }
}

pub fn reverse_server(broker: Arc<TestBroker>, config: MqServerConfig) -> MqServer {
    let server = MqServer::new(broker, config);
    server.register_handler(reverse_handler).unwrap();
    server
}
