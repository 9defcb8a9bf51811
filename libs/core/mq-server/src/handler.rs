//! Handler registry and the per-worker message pipeline.
//!
//! Each registered message type maps to a factory. Every worker asks the
//! factory for its own [`MessageHandler`], so handler stats are per worker and
//! a replacement worker starts from fresh counters.
//!
//! Per-message policy:
//! 1. success: publish the response (a null marker when there is none) to the
//!    message's `reply_to`, or the type's Out queue, unless publishing is disabled
//! 2. retryable failure with attempts left: re-queue to the source queue
//! 3. otherwise: stamp the error and publish to the type's DLQ
//!
//! A message the broker refuses to re-queue is dead-lettered instead. When
//! routing fails outright the original payload is pushed back onto its source
//! queue before the broker error is returned.

use crate::broker::MessageBroker;
use crate::config::MessageFilters;
use crate::error::{HandlerError, MqError};
use crate::message::{Message, MqMessage, ResponseStatus};
use crate::metrics::MqMetrics;
use crate::queue_names::QueueNames;
use crate::stats::{HandlerStats, HandlerStatsSnapshot};
use crate::thread::run_guarded;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Handler function: typed request in, optional response out
pub type HandlerFn<T, R> = dyn Fn(&Message<T>) -> Result<Option<R>, HandlerError> + Send + Sync;

/// Callback invoked on every handler failure, before retry/DLQ routing
pub type ErrorCallback<T> = dyn Fn(&Message<T>, &HandlerError) + Send + Sync;

/// Builds a fresh type-erased handler for one worker
pub type HandlerFactory = Arc<dyn Fn(&HandlerContext) -> Box<dyn MessageProcessor> + Send + Sync>;

/// Server settings a handler needs, plus the queue its worker drains
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub queue: String,
    pub queue_prefix: String,
    pub notify_topic: String,
    pub retry_count: u32,
    /// Publish responses for this type at all
    pub publish_responses: bool,
    /// Publish to the Out queue when a request has no `reply_to`
    pub publish_to_outq: bool,
    pub filters: MessageFilters,
}

/// Type-erased message handler driven by a worker
pub trait MessageProcessor: Send + Sync {
    fn type_name(&self) -> &str;

    /// Drain `queue` until it is empty or `keep_running` turns false.
    ///
    /// Handler faults are absorbed by the retry/DLQ policy; only broker
    /// failures are returned.
    fn process_queue(
        &self,
        broker: &dyn MessageBroker,
        queue: &str,
        keep_running: &dyn Fn() -> bool,
    ) -> Result<usize, MqError>;

    fn stats(&self) -> HandlerStatsSnapshot;
}

pub struct MessageHandler<T, R> {
    handler: Arc<HandlerFn<T, R>>,
    on_error: Option<Arc<ErrorCallback<T>>>,
    names: QueueNames,
    context: HandlerContext,
    stats: HandlerStats,
    metrics: MqMetrics,
}

impl<T, R> MessageHandler<T, R>
where
    T: MqMessage,
    R: Serialize + 'static,
{
    pub fn new(
        handler: Arc<HandlerFn<T, R>>,
        on_error: Option<Arc<ErrorCallback<T>>>,
        context: HandlerContext,
    ) -> Self {
        Self {
            handler,
            on_error,
            names: QueueNames::with_prefix(&context.queue_prefix, T::TYPE_NAME),
            metrics: MqMetrics::new(context.queue.clone(), T::TYPE_NAME),
            context,
            stats: HandlerStats::default(),
        }
    }

    fn process_message(
        &self,
        broker: &dyn MessageBroker,
        queue: &str,
        payload: Vec<u8>,
    ) -> Result<(), MqError> {
        self.stats.record_received(queue == self.names.priority_q);
        self.metrics.message_received();

        let mut message = match self.decode(&payload) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(queue = %queue, "Request filter dropped message");
                return Ok(());
            }
            Err(e) => {
                warn!(
                    queue = %queue,
                    error = %e,
                    "Undeserializable message, moving raw payload to DLQ"
                );
                self.stats.record_failed();
                self.metrics.message_failed("SerializationError");
                self.metrics.message_dead_lettered();
                return broker
                    .publish(&self.names.dlq, &payload)
                    .map_err(|e| self.restore(broker, queue, &payload, e));
            }
        };

        let started = Instant::now();
        let outcome = run_guarded(|| (self.handler)(&message)).unwrap_or_else(|panic| {
            Err(HandlerError::new(format!("handler panicked: {}", panic))
                .with_code("HandlerPanicked"))
        });

        match outcome {
            Ok(response) => {
                self.stats.record_processed();
                self.metrics.message_processed(started.elapsed());
                debug!(
                    message_id = %message.id,
                    queue = %queue,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Message processed"
                );
                self.publish_response(broker, &message, response)
            }
            Err(err) => self
                .handle_failure(broker, queue, &mut message, err)
                .map_err(|e| self.restore(broker, queue, &payload, e)),
        }
    }

    /// Deserialize a payload and run it through the request filter.
    ///
    /// `Ok(None)` means the filter dropped the message.
    fn decode(&self, payload: &[u8]) -> Result<Option<Message<T>>, MqError> {
        let Some(filter) = &self.context.filters.request else {
            return Message::from_bytes(payload).map(Some);
        };

        let raw: Message<Value> = Message::from_bytes(payload)?;
        let filtered = run_guarded(|| filter(raw)).map_err(|panic| {
            HandlerError::unretryable(format!("request filter panicked: {}", panic))
                .with_code("RequestFilterPanicked")
        })?;

        match filtered {
            Some(message) => Message::from_bytes(&message.to_bytes()?).map(Some),
            None => Ok(None),
        }
    }

    /// Push a popped payload back onto its source queue after routing failed
    fn restore(
        &self,
        broker: &dyn MessageBroker,
        queue: &str,
        payload: &[u8],
        cause: MqError,
    ) -> MqError {
        match broker.publish(queue, payload) {
            Ok(()) => warn!(
                queue = %queue,
                error = %cause,
                "Failed to route message, restored it to the source queue"
            ),
            Err(e) => error!(
                queue = %queue,
                error = %cause,
                restore_error = %e,
                "Failed to route or restore message, message lost"
            ),
        }
        cause
    }

    fn publish_response(
        &self,
        broker: &dyn MessageBroker,
        request: &Message<T>,
        response: Option<R>,
    ) -> Result<(), MqError> {
        if !self.context.publish_responses {
            return Ok(());
        }

        let target = match request.reply_to.as_deref() {
            Some(reply_to) => reply_to,
            None if self.context.publish_to_outq => self.names.out_q.as_str(),
            None => return Ok(()),
        };

        let body = match response.map(serde_json::to_value).transpose() {
            Ok(Some(body)) => match self.filter_response(body) {
                Some(body) => body,
                None => return Ok(()),
            },
            Ok(None) => Value::Null,
            Err(e) => {
                error!(
                    message_id = %request.id,
                    error = %e,
                    "Failed to serialize response, dropping it"
                );
                return Ok(());
            }
        };

        let reply = request.reply(body);
        broker.publish(target, &reply.to_bytes()?)?;
        broker.notify(&self.context.notify_topic, target)?;

        debug!(message_id = %request.id, target = %target, "Response published");
        Ok(())
    }

    fn filter_response(&self, body: Value) -> Option<Value> {
        let Some(filter) = &self.context.filters.response else {
            return Some(body);
        };
        match run_guarded(|| filter(body)) {
            Ok(body) => Some(body),
            Err(panic) => {
                error!(panic = %panic, "Response filter panicked, dropping response");
                None
            }
        }
    }

    fn handle_failure(
        &self,
        broker: &dyn MessageBroker,
        queue: &str,
        message: &mut Message<T>,
        err: HandlerError,
    ) -> Result<(), MqError> {
        self.stats.record_failed();
        self.metrics.message_failed(&err.error_code);

        if let Some(on_error) = &self.on_error {
            if let Err(panic) = run_guarded(|| on_error(message, &err)) {
                error!(message_id = %message.id, panic = %panic, "Error callback panicked");
            }
        }

        message.retry_attempts += 1;

        if err.retryable && message.retry_attempts <= self.context.retry_count {
            warn!(
                message_id = %message.id,
                queue = %queue,
                retry_attempts = message.retry_attempts,
                retry_count = self.context.retry_count,
                error = %err,
                "Message handler failed, re-queueing"
            );

            match self.requeue(broker, queue, message) {
                Ok(()) => {
                    self.stats.record_retry();
                    self.metrics.message_retried();
                    return Ok(());
                }
                Err(e) => warn!(
                    message_id = %message.id,
                    queue = %queue,
                    error = %e,
                    "Failed to re-queue message, moving to DLQ"
                ),
            }
        }

        message.error = Some(ResponseStatus::from(&err));
        self.metrics.message_dead_lettered();
        warn!(
            message_id = %message.id,
            dlq = %self.names.dlq,
            retry_attempts = message.retry_attempts,
            error = %err,
            "Message handler failed, moving to DLQ"
        );

        broker.publish(&self.names.dlq, &message.to_bytes()?)
    }

    fn requeue(
        &self,
        broker: &dyn MessageBroker,
        queue: &str,
        message: &Message<T>,
    ) -> Result<(), MqError> {
        broker.publish(queue, &message.to_bytes()?)?;
        // The next wake-up or poll still finds it
        if let Err(e) = broker.notify(&self.context.notify_topic, queue) {
            warn!(queue = %queue, error = %e, "Failed to notify re-queued message");
        }
        Ok(())
    }
}

impl<T, R> MessageProcessor for MessageHandler<T, R>
where
    T: MqMessage,
    R: Serialize + 'static,
{
    fn type_name(&self) -> &str {
        T::TYPE_NAME
    }

    fn process_queue(
        &self,
        broker: &dyn MessageBroker,
        queue: &str,
        keep_running: &dyn Fn() -> bool,
    ) -> Result<usize, MqError> {
        let mut processed = 0;

        while keep_running() {
            let Some(payload) = broker.get(queue)? else {
                break;
            };
            self.process_message(broker, queue, payload)?;
            processed += 1;
        }

        Ok(processed)
    }

    fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot(&self.context.queue)
    }
}

/// Registered handler for one message type
#[derive(Clone)]
pub struct HandlerEntry {
    pub type_name: &'static str,
    pub thread_count: usize,
    pub factory: HandlerFactory,
}

/// Message type → handler, populated before the server starts
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `T`.
    ///
    /// Returns [`MqError::DuplicateHandler`] if `T` already has one.
    pub fn register<T, R>(
        &mut self,
        handler: Arc<HandlerFn<T, R>>,
        on_error: Option<Arc<ErrorCallback<T>>>,
        thread_count: usize,
    ) -> Result<(), MqError>
    where
        T: MqMessage,
        R: Serialize + 'static,
    {
        if self.contains(T::TYPE_NAME) {
            return Err(MqError::DuplicateHandler(T::TYPE_NAME.to_string()));
        }

        let factory: HandlerFactory = Arc::new(move |context: &HandlerContext| {
            Box::new(MessageHandler::new(
                Arc::clone(&handler),
                on_error.clone(),
                context.clone(),
            )) as Box<dyn MessageProcessor>
        });

        self.entries.push(HandlerEntry {
            type_name: T::TYPE_NAME,
            thread_count: thread_count.max(1),
            factory,
        });
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.iter().any(|e| e.type_name == type_name)
    }

    /// Entries in registration order
    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.type_name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
