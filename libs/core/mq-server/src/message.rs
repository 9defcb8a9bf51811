//! Message envelope
//!
//! Wraps a typed body with its identity, reply routing, retry counter and,
//! once dead-lettered, the fault that sent it there.

use crate::error::{HandlerError, MqError};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Compile-time identity for a message type.
///
/// `TYPE_NAME` is the `T` in `mq:T.inq` and the key handlers are registered under.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Reverse { value: String }
///
/// impl MqMessage for Reverse {
///     const TYPE_NAME: &'static str = "Reverse";
/// }
/// ```
pub trait MqMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Structured fault stamped on a dead-lettered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub error_code: String,
    pub message: String,
}

impl From<&HandlerError> for ResponseStatus {
    fn from(err: &HandlerError) -> Self {
        Self {
            error_code: err.error_code.clone(),
            message: err.message.clone(),
        }
    }
}

/// The envelope every queue carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    /// Time-ordered unique id
    pub id: Uuid,

    pub created_at: DateTime<Utc>,

    pub body: T,

    /// Queue the response should be published to instead of the type's Out queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Id of the request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseStatus>,

    #[serde(default)]
    pub retry_attempts: u32,

    /// Positive values are routed to the priority queue
    #[serde(default)]
    pub priority: i64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

impl<T> Message<T> {
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            body,
            reply_to: None,
            reply_id: None,
            error: None,
            retry_attempts: 0,
            priority: 0,
            meta: HashMap::new(),
        }
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Build the response envelope for this request
    pub fn reply<R>(&self, body: R) -> Message<R> {
        let mut response = Message::new(body);
        response.reply_id = Some(self.id);
        response
    }

    pub fn is_priority(&self) -> bool {
        self.priority > 0
    }

    /// Get how long ago the message was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

impl<T: Serialize> Message<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MqError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> Message<T> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MqError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
