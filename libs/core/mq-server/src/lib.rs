//! MQ Server
//!
//! A thread-per-worker message queue server over a pluggable broker.
//!
//! ## Features
//!
//! - **Typed handlers**: `register_handler::<T, R>` maps a message type to a function
//! - **Worker threads**: one OS thread per worker, woken by control-topic notifications
//! - **Retry and DLQ**: failed messages are re-queued `retry_count` times, then dead-lettered
//! - **Priority queues**: per-type priority workers listed ahead of the normal inbox
//! - **Filters and whitelists**: request/response hooks and per-type publish gating
//! - **Self-healing control loop**: broker errors trigger backoff and restart
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use mq_server::{HandlerError, Message, MqMessage, MqServer, MqServerConfig, RedisBroker};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Reverse { value: String }
//!
//! impl MqMessage for Reverse {
//!     const TYPE_NAME: &'static str = "Reverse";
//! }
//!
//! let broker = Arc::new(RedisBroker::connect("redis://127.0.0.1:6379")?);
//! let server = MqServer::new(broker, MqServerConfig::new());
//!
//! server.register_handler(|msg: &Message<Reverse>| -> Result<Option<Reverse>, HandlerError> {
//!     Ok(Some(Reverse { value: msg.body.value.chars().rev().collect() }))
//! })?;
//! server.start()?;
//! ```

pub mod backoff;
mod broker;
mod client;
mod config;
mod control;
mod dlq;
mod error;
mod handler;
mod health;
mod memory;
mod message;
pub mod metrics;
mod queue_names;
#[cfg(feature = "redis")]
mod redis_broker;
mod retry;
mod server;
mod stats;
mod status;
pub mod thread;
mod worker;

// Re-export main types
pub use broker::{FailoverHook, MessageBroker, SubscriptionControl, SubscriptionEvent};
pub use client::MqClient;
pub use config::{MessageFilters, MqServerConfig, RequestFilter, ResponseFilter};
pub use control::{ControlMessage, CONTROL_COMMAND};
pub use dlq::{DlqManager, DlqStats, ReprocessResult};
pub use error::{HandlerError, MqError};
pub use handler::{
    ErrorCallback, HandlerContext, HandlerEntry, HandlerFactory, HandlerFn, HandlerRegistry,
    MessageHandler, MessageProcessor,
};
pub use health::{admin_router, full_admin_router, health_router, HealthState};
pub use memory::InMemoryBroker;
pub use message::{Message, MqMessage, ResponseStatus};
pub use metrics::{init_metrics, MqMetrics};
pub use queue_names::{QueueNames, QueueRole, MQ_PREFIX, TOPIC_IN};
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
pub use retry::{retry_with_backoff, RetryConfig};
pub use server::{MqServer, ServerErrorCallback};
pub use stats::{HandlerStats, HandlerStatsSnapshot};
pub use status::{AtomicStatus, PendingOperation, WorkerOperation, WorkerStatus};
pub use thread::{ReclaimOutcome, ReclaimPolicy};
pub use worker::{MqWorker, WorkerErrorHandler};
