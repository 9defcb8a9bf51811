//! Dead Letter Queue (DLQ) management
//!
//! Inspects and replays messages that exhausted their retries.

use crate::broker::MessageBroker;
use crate::config::{is_whitelisted, MqServerConfig};
use crate::error::MqError;
use crate::message::Message;
use crate::queue_names::QueueNames;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// DLQ depth for one message type
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub queue: String,
    pub length: usize,
}

/// Outcome of a reprocess batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessResult {
    /// Moved back to the In (or priority) queue
    pub reprocessed: usize,
    /// Not an envelope; returned to the DLQ untouched
    pub skipped: usize,
}

/// Dead Letter Queue manager
#[derive(Clone)]
pub struct DlqManager {
    broker: Arc<dyn MessageBroker>,
    queue_prefix: String,
    notify_topic: String,
    priority_queues_whitelist: Option<Vec<String>>,
}

impl DlqManager {
    pub fn new(broker: Arc<dyn MessageBroker>, config: &MqServerConfig) -> Self {
        Self {
            broker,
            queue_prefix: config.queue_prefix.clone(),
            notify_topic: config.control_topic.clone(),
            priority_queues_whitelist: config.priority_queues_whitelist.clone(),
        }
    }

    fn names(&self, type_name: &str) -> QueueNames {
        QueueNames::with_prefix(&self.queue_prefix, type_name)
    }

    pub fn stats(&self, type_name: &str) -> Result<DlqStats, MqError> {
        let names = self.names(type_name);
        Ok(DlqStats {
            length: self.broker.queue_len(&names.dlq)?,
            queue: names.dlq,
        })
    }

    /// Pop the oldest dead letter for inspection.
    ///
    /// An unreadable letter is pushed back to the end of the DLQ and the
    /// parse error returned.
    pub fn pop(&self, type_name: &str) -> Result<Option<Message<Value>>, MqError> {
        let dlq = self.names(type_name).dlq;
        let Some(bytes) = self.broker.get(&dlq)? else {
            return Ok(None);
        };

        match Message::from_bytes(&bytes) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!(queue = %dlq, error = %e, "Unreadable dead letter, returning it to the DLQ");
                self.broker.publish(&dlq, &bytes)?;
                Err(e)
            }
        }
    }

    /// Move up to `count` dead letters back to their inbox with retries reset.
    ///
    /// Each letter present when the call starts is visited at most once.
    pub fn reprocess(&self, type_name: &str, count: usize) -> Result<ReprocessResult, MqError> {
        let names = self.names(type_name);
        let mut result = ReprocessResult::default();
        let available = self.broker.queue_len(&names.dlq)?;

        for _ in 0..count.min(available) {
            let Some(bytes) = self.broker.get(&names.dlq)? else {
                break;
            };

            let mut message = match Message::<Value>::from_bytes(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(queue = %names.dlq, error = %e, "Skipping unreadable dead letter");
                    self.broker.publish(&names.dlq, &bytes)?;
                    result.skipped += 1;
                    continue;
                }
            };

            message.retry_attempts = 0;
            message.error = None;
            let target = if message.is_priority()
                && is_whitelisted(&self.priority_queues_whitelist, type_name)
            {
                &names.priority_q
            } else {
                &names.in_q
            };

            self.broker.publish(target, &message.to_bytes()?)?;
            self.broker.notify(&self.notify_topic, target)?;
            debug!(queue = %target, message_id = %message.id, "Reprocessing dead letter");
            result.reprocessed += 1;
        }

        if result.reprocessed > 0 {
            info!(
                message_type = type_name,
                reprocessed = result.reprocessed,
                skipped = result.skipped,
                "Reprocessed dead letters"
            );
        }
        Ok(result)
    }

    /// Drop every dead letter for `type_name`
    pub fn purge(&self, type_name: &str) -> Result<usize, MqError> {
        let dlq = self.names(type_name).dlq;
        let mut purged = 0;
        while self.broker.get(&dlq)?.is_some() {
            purged += 1;
        }
        info!(queue = %dlq, purged, "Purged DLQ");
        Ok(purged)
    }
}
