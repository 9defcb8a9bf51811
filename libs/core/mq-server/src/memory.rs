//! In-process broker.
//!
//! Queues are mutex-guarded deques; topic subscribers are channel senders.
//! Useful for embedding the server in a single process and for tests, which
//! can simulate a lost connection or a failover.

use crate::broker::{FailoverHook, MessageBroker, SubscriptionControl, SubscriptionEvent};
use crate::error::MqError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use tracing::{debug, info};

enum Signal {
    Payload(String),
    Disconnect,
}

struct Subscriber {
    id: u64,
    sender: Sender<Signal>,
}

#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    failover_hooks: Mutex<Vec<FailoverHook>>,
    next_subscriber_id: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Break every live subscription as if the connection dropped.
    ///
    /// Each blocked `subscribe` call returns a broker error.
    pub fn disconnect_subscribers(&self) -> usize {
        let drained: Vec<Subscriber> = match self.subscribers.lock() {
            Ok(mut subs) => subs.drain().flat_map(|(_, list)| list).collect(),
            Err(_) => return 0,
        };

        let count = drained.len();
        for sub in drained {
            let _ = sub.sender.send(Signal::Disconnect);
        }
        info!(subscribers = count, "Disconnected in-memory subscribers");
        count
    }

    /// Fire every registered failover hook
    pub fn trigger_failover(&self) {
        let hooks: Vec<FailoverHook> = match self.failover_hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => return,
        };

        info!(hooks = hooks.len(), "Triggering in-memory broker failover");
        for hook in hooks {
            hook();
        }
    }

    fn remove_subscriber(&self, topic: &str, id: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            if let Some(list) = subs.get_mut(topic) {
                list.retain(|s| s.id != id);
            }
        }
    }
}

impl MessageBroker for InMemoryBroker {
    fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MqError> {
        let mut queues = self.queues.lock()?;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    fn get(&self, queue: &str) -> Result<Option<Vec<u8>>, MqError> {
        let mut queues = self.queues.lock()?;
        Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    fn notify(&self, topic: &str, payload: &str) -> Result<(), MqError> {
        let mut subs = self.subscribers.lock()?;
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|s| s.sender.send(Signal::Payload(payload.to_string())).is_ok());
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        on_event: &mut dyn FnMut(SubscriptionEvent) -> SubscriptionControl,
    ) -> Result<(), MqError> {
        let (sender, receiver) = mpsc::channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        self.subscribers
            .lock()?
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        debug!(topic = %topic, subscriber = id, "Subscribed");

        if on_event(SubscriptionEvent::Subscribed) == SubscriptionControl::Unsubscribe {
            self.remove_subscriber(topic, id);
            return Ok(());
        }

        loop {
            match receiver.recv() {
                Ok(Signal::Payload(payload)) => {
                    if on_event(SubscriptionEvent::Message(payload))
                        == SubscriptionControl::Unsubscribe
                    {
                        self.remove_subscriber(topic, id);
                        debug!(topic = %topic, subscriber = id, "Unsubscribed");
                        return Ok(());
                    }
                }
                Ok(Signal::Disconnect) | Err(_) => {
                    self.remove_subscriber(topic, id);
                    return Err(MqError::broker(format!(
                        "subscription to '{}' lost",
                        topic
                    )));
                }
            }
        }
    }

    fn queue_len(&self, queue: &str) -> Result<usize, MqError> {
        let queues = self.queues.lock()?;
        Ok(queues.get(queue).map_or(0, VecDeque::len))
    }

    fn on_failover(&self, hook: FailoverHook) {
        if let Ok(mut hooks) = self.failover_hooks.lock() {
            hooks.push(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for_subscriber(broker: &InMemoryBroker, topic: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.subscriber_count(topic) == 0 {
            assert!(Instant::now() < deadline, "subscriber never registered");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let broker = InMemoryBroker::new();
        broker.publish("q", b"1").unwrap();
        broker.publish("q", b"2").unwrap();

        assert_eq!(broker.queue_len("q").unwrap(), 2);
        assert_eq!(broker.get("q").unwrap(), Some(b"1".to_vec()));
        assert_eq!(broker.get("q").unwrap(), Some(b"2".to_vec()));
        assert_eq!(broker.get("q").unwrap(), None);
        assert_eq!(broker.get("missing").unwrap(), None);
    }

    #[test]
    fn test_subscribe_receives_until_unsubscribe() {
        let broker = Arc::new(InMemoryBroker::new());
        let sub_broker = Arc::clone(&broker);

        let handle = thread::spawn(move || {
            let mut received = Vec::new();
            let result = sub_broker.subscribe("topic", &mut |event| match event {
                SubscriptionEvent::Subscribed => SubscriptionControl::Continue,
                SubscriptionEvent::Message(payload) if payload == "done" => {
                    SubscriptionControl::Unsubscribe
                }
                SubscriptionEvent::Message(payload) => {
                    received.push(payload);
                    SubscriptionControl::Continue
                }
            });
            (result.is_ok(), received)
        });

        wait_for_subscriber(&broker, "topic");
        broker.notify("topic", "a").unwrap();
        broker.notify("topic", "b").unwrap();
        broker.notify("topic", "done").unwrap();

        let (ok, received) = handle.join().unwrap();
        assert!(ok);
        assert_eq!(received, vec!["a", "b"]);
        assert_eq!(broker.subscriber_count("topic"), 0);
    }

    #[test]
    fn test_disconnect_fails_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        let sub_broker = Arc::clone(&broker);

        let handle = thread::spawn(move || {
            sub_broker.subscribe("topic", &mut |_| SubscriptionControl::Continue)
        });

        wait_for_subscriber(&broker, "topic");
        assert_eq!(broker.disconnect_subscribers(), 1);

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(MqError::Broker(_))));
    }

    #[test]
    fn test_failover_hooks_fire() {
        let broker = InMemoryBroker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        broker.on_failover(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        broker.trigger_failover();
        broker.trigger_failover();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
