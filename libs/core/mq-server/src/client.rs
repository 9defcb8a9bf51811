//! Client for publishing requests and reading responses
//!
//! Every publish is followed by a notification on the control topic carrying
//! the queue name, which wakes the workers bound to that queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use mq_server::{Message, MqClient};
//!
//! let client = MqClient::new(broker);
//! client.publish(Reverse { value: "Hello".into() })?;
//!
//! let response = client.get_response("mq:Reverse.outq")?;
//! ```

use crate::broker::MessageBroker;
use crate::config::{is_whitelisted, MqServerConfig};
use crate::error::MqError;
use crate::message::{Message, MqMessage};
use crate::queue_names::{QueueNames, MQ_PREFIX, TOPIC_IN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct MqClient {
    broker: Arc<dyn MessageBroker>,
    queue_prefix: String,
    notify_topic: String,
    priority_queues_whitelist: Option<Vec<String>>,
}

impl MqClient {
    /// Create a client using the default prefix and control topic
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            queue_prefix: MQ_PREFIX.to_string(),
            notify_topic: TOPIC_IN.to_string(),
            priority_queues_whitelist: None,
        }
    }

    /// Create a client matching a server's queue prefix, control topic and
    /// priority queue whitelist
    pub fn from_config(broker: Arc<dyn MessageBroker>, config: &MqServerConfig) -> Self {
        Self {
            broker,
            queue_prefix: config.queue_prefix.clone(),
            notify_topic: config.control_topic.clone(),
            priority_queues_whitelist: config.priority_queues_whitelist.clone(),
        }
    }

    pub fn queue_names<T: MqMessage>(&self) -> QueueNames {
        QueueNames::with_prefix(&self.queue_prefix, T::TYPE_NAME)
    }

    /// Publish a request body to `T`'s In queue
    pub fn publish<T: MqMessage>(&self, body: T) -> Result<Message<T>, MqError> {
        let message = Message::new(body);
        self.publish_message(&message)?;
        Ok(message)
    }

    /// Publish an envelope to `T`'s In queue, or its priority queue when
    /// `priority > 0` and `T` has priority workers
    pub fn publish_message<T: MqMessage>(&self, message: &Message<T>) -> Result<(), MqError> {
        let names = self.queue_names::<T>();
        let queue = if message.is_priority()
            && is_whitelisted(&self.priority_queues_whitelist, T::TYPE_NAME)
        {
            &names.priority_q
        } else {
            &names.in_q
        };
        self.publish_to(queue, message)
    }

    /// Publish an envelope to an arbitrary queue and wake its workers
    pub fn publish_to<T: Serialize>(&self, queue: &str, message: &Message<T>) -> Result<(), MqError> {
        self.broker.publish(queue, &message.to_bytes()?)?;
        self.notify_queue(queue)?;
        debug!(queue = %queue, message_id = %message.id, "Published message");
        Ok(())
    }

    /// Pop the next message from `queue`
    pub fn get<T: DeserializeOwned>(&self, queue: &str) -> Result<Option<Message<T>>, MqError> {
        match self.broker.get(queue)? {
            Some(bytes) => Ok(Some(Message::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Pop the next response from `queue` without knowing its type
    pub fn get_response(&self, queue: &str) -> Result<Option<Message<Value>>, MqError> {
        self.get::<Value>(queue)
    }

    /// Wake the workers bound to `queue`
    pub fn notify_queue(&self, queue: &str) -> Result<(), MqError> {
        self.broker.notify(&self.notify_topic, queue)
    }

    pub fn queue_len(&self, queue: &str) -> Result<usize, MqError> {
        self.broker.queue_len(queue)
    }
}
