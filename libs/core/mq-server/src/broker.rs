//! Broker seam.
//!
//! The server only needs FIFO queues of bytes, a publish/notify topic and a
//! blocking subscription. Every method is synchronous: callers are the
//! server's own OS threads.

use crate::error::MqError;
use std::sync::Arc;

/// Event delivered to a subscription callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The subscription is live; payloads published from now on are delivered
    Subscribed,
    /// A payload published on the topic
    Message(String),
}

/// What the subscription should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionControl {
    Continue,
    Unsubscribe,
}

/// Callback fired when the broker reports a topology change
pub type FailoverHook = Arc<dyn Fn() + Send + Sync>;

pub trait MessageBroker: Send + Sync {
    /// Append a payload to the tail of a queue
    fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MqError>;

    /// Pop the payload at the head of a queue, `None` when empty
    fn get(&self, queue: &str) -> Result<Option<Vec<u8>>, MqError>;

    /// Publish a string on a pub/sub topic
    fn notify(&self, topic: &str, payload: &str) -> Result<(), MqError>;

    /// Block on a topic subscription.
    ///
    /// `on_event` receives `Subscribed` once, then every payload. Returns `Ok`
    /// after the callback answers `Unsubscribe`, or `Err` when the transport fails.
    fn subscribe(
        &self,
        topic: &str,
        on_event: &mut dyn FnMut(SubscriptionEvent) -> SubscriptionControl,
    ) -> Result<(), MqError>;

    /// Number of payloads waiting in a queue
    fn queue_len(&self, queue: &str) -> Result<usize, MqError>;

    /// Register a hook fired on broker failover
    fn on_failover(&self, _hook: FailoverHook) {}
}
