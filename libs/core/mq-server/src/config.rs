//! Server configuration
//!
//! This module provides `MqServerConfig`, built with `with_*` methods or, with
//! the `config` feature, loaded from `MQ_*` environment variables.

use crate::backoff::MAX_BACKOFF;
use crate::message::Message;
use crate::queue_names::{MQ_PREFIX, TOPIC_IN};
use crate::thread::ReclaimPolicy;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Runs on every decoded request before its handler; `None` drops the message
pub type RequestFilter = Arc<dyn Fn(Message<Value>) -> Option<Message<Value>> + Send + Sync>;

/// Runs on every response body before it is published
pub type ResponseFilter = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Request and response hooks shared by every handler
#[derive(Clone, Default)]
pub struct MessageFilters {
    pub request: Option<RequestFilter>,
    pub response: Option<ResponseFilter>,
}

impl fmt::Debug for MessageFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilters")
            .field("request", &self.request.is_some())
            .field("response", &self.response.is_some())
            .finish()
    }
}

/// None admits every type, an empty list admits none
pub(crate) fn is_whitelisted(whitelist: &Option<Vec<String>>, type_name: &str) -> bool {
    match whitelist {
        None => true,
        Some(types) => types.iter().any(|t| t == type_name),
    }
}

fn type_list<I, S>(types: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Some(types.into_iter().map(Into::into).collect())
}

/// Configuration for the MQ server
#[derive(Debug, Clone)]
pub struct MqServerConfig {
    /// Retries after the first failed attempt (`1` = two attempts in total)
    pub retry_count: u32,

    /// Delay before the control loop restarts itself after a broker error
    /// (None = stay stopped)
    pub keep_alive_retry_after: Option<Duration>,

    /// Types that get priority-queue workers (None = all, empty = none)
    pub priority_queues_whitelist: Option<Vec<String>>,

    /// Never publish handler responses to Out/ReplyTo queues
    pub disable_publishing_responses: bool,

    /// Request types whose responses are published (None = all)
    pub publish_responses_whitelist: Option<Vec<String>>,

    /// Request types whose responses may go to the out queue when no
    /// ReplyTo is set (None = all, empty = none)
    pub publish_to_outq_whitelist: Option<Vec<String>>,

    /// Hooks applied around every handler call
    pub filters: MessageFilters,

    /// Pub/sub topic for wake-ups and administrative commands
    pub control_topic: String,

    /// Prefix for queue names
    pub queue_prefix: String,

    /// Upper bound of the reconnect backoff
    pub max_backoff: Duration,

    /// Thread join timeouts used on stop/dispose
    pub reclaim: ReclaimPolicy,
}

impl MqServerConfig {
    pub fn new() -> Self {
        Self {
            retry_count: 1,
            keep_alive_retry_after: Some(Duration::from_secs(1)),
            priority_queues_whitelist: None,
            disable_publishing_responses: false,
            publish_responses_whitelist: None,
            publish_to_outq_whitelist: None,
            filters: MessageFilters::default(),
            control_topic: TOPIC_IN.to_string(),
            queue_prefix: MQ_PREFIX.to_string(),
            max_backoff: MAX_BACKOFF,
            reclaim: ReclaimPolicy::default(),
        }
    }

    /// Set the retry count
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the self-healing delay (None disables self-healing)
    pub fn with_keep_alive_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.keep_alive_retry_after = delay;
        self
    }

    /// Only create priority workers for these message types
    pub fn with_priority_queues_whitelist<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_queues_whitelist = type_list(types);
        self
    }

    /// Create no priority workers at all
    pub fn disable_priority_queues(mut self) -> Self {
        self.priority_queues_whitelist = Some(Vec::new());
        self
    }

    /// Enable or disable publishing responses
    pub fn with_disable_publishing_responses(mut self, disable: bool) -> Self {
        self.disable_publishing_responses = disable;
        self
    }

    /// Only publish responses of these request types
    pub fn with_publish_responses_whitelist<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.publish_responses_whitelist = type_list(types);
        self
    }

    /// Only these request types may publish to their out queue
    pub fn with_publish_to_outq_whitelist<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.publish_to_outq_whitelist = type_list(types);
        self
    }

    /// Never publish to out queues; ReplyTo responses still go out
    pub fn disable_publishing_to_outq(mut self) -> Self {
        self.publish_to_outq_whitelist = Some(Vec::new());
        self
    }

    pub fn with_request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Message<Value>) -> Option<Message<Value>> + Send + Sync + 'static,
    {
        self.filters.request = Some(Arc::new(filter));
        self
    }

    pub fn with_response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.filters.response = Some(Arc::new(filter));
        self
    }

    pub fn with_control_topic(mut self, topic: impl Into<String>) -> Self {
        self.control_topic = topic.into();
        self
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_reclaim_policy(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Whether `type_name` gets priority-queue workers
    pub fn uses_priority_queue(&self, type_name: &str) -> bool {
        is_whitelisted(&self.priority_queues_whitelist, type_name)
    }

    /// Whether responses to `type_name` requests are published at all
    pub fn publishes_responses(&self, type_name: &str) -> bool {
        !self.disable_publishing_responses
            && is_whitelisted(&self.publish_responses_whitelist, type_name)
    }

    /// Whether responses to `type_name` requests without a ReplyTo go to the out queue
    pub fn publishes_to_outq(&self, type_name: &str) -> bool {
        is_whitelisted(&self.publish_to_outq_whitelist, type_name)
    }
}

impl Default for MqServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "config")]
mod env {
    use super::*;
    use core_config::{env_bool, env_parse, ConfigError, FromEnv};

    impl FromEnv for MqServerConfig {
        /// Reads from environment variables with defaults:
        /// - MQ_RETRY_COUNT: defaults to 1
        /// - MQ_KEEP_ALIVE_RETRY_AFTER_MS: defaults to 1000, `0` or `off` disables
        /// - MQ_DISABLE_PRIORITY_QUEUES: defaults to false
        /// - MQ_PRIORITY_QUEUES_WHITELIST: comma separated type names
        /// - MQ_DISABLE_PUBLISHING_RESPONSES: defaults to false
        /// - MQ_PUBLISH_RESPONSES_WHITELIST: comma separated type names
        /// - MQ_DISABLE_PUBLISHING_TO_OUTQ: defaults to false
        /// - MQ_PUBLISH_TO_OUTQ_WHITELIST: comma separated type names
        /// - MQ_CONTROL_TOPIC: defaults to `mq:topic:in`
        /// - MQ_QUEUE_PREFIX: defaults to `mq:`
        fn from_env() -> Result<Self, ConfigError> {
            let mut config = MqServerConfig::new()
                .with_retry_count(env_parse("MQ_RETRY_COUNT", 1u32)?)
                .with_disable_publishing_responses(env_bool(
                    "MQ_DISABLE_PUBLISHING_RESPONSES",
                    false,
                )?)
                .with_control_topic(core_config::env_or_default("MQ_CONTROL_TOPIC", TOPIC_IN))
                .with_queue_prefix(core_config::env_or_default("MQ_QUEUE_PREFIX", MQ_PREFIX));

            let keep_alive = core_config::env_or_default("MQ_KEEP_ALIVE_RETRY_AFTER_MS", "1000");
            config.keep_alive_retry_after = if keep_alive.eq_ignore_ascii_case("off") {
                None
            } else {
                let ms: u64 = keep_alive.parse().map_err(|e| ConfigError::ParseError {
                    key: "MQ_KEEP_ALIVE_RETRY_AFTER_MS".to_string(),
                    details: format!("{}", e),
                })?;
                (ms > 0).then(|| Duration::from_millis(ms))
            };

            if env_bool("MQ_DISABLE_PRIORITY_QUEUES", false)? {
                config = config.disable_priority_queues();
            } else if let Some(types) = env_list("MQ_PRIORITY_QUEUES_WHITELIST") {
                config.priority_queues_whitelist = Some(types);
            }

            config.publish_responses_whitelist = env_list("MQ_PUBLISH_RESPONSES_WHITELIST");

            if env_bool("MQ_DISABLE_PUBLISHING_TO_OUTQ", false)? {
                config = config.disable_publishing_to_outq();
            } else {
                config.publish_to_outq_whitelist = env_list("MQ_PUBLISH_TO_OUTQ_WHITELIST");
            }

            Ok(config)
        }
    }

    fn env_list(key: &str) -> Option<Vec<String>> {
        let list = std::env::var(key).ok()?;
        Some(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MqServerConfig::default();

        assert_eq!(config.retry_count, 1);
        assert_eq!(config.keep_alive_retry_after, Some(Duration::from_secs(1)));
        assert_eq!(config.control_topic, "mq:topic:in");
        assert_eq!(config.queue_prefix, "mq:");
        assert!(!config.disable_publishing_responses);
        assert!(config.uses_priority_queue("Anything"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = MqServerConfig::new()
            .with_retry_count(3)
            .with_keep_alive_retry_after(None)
            .with_priority_queues_whitelist(["Hello"])
            .with_disable_publishing_responses(true);

        assert_eq!(config.retry_count, 3);
        assert!(config.keep_alive_retry_after.is_none());
        assert!(config.uses_priority_queue("Hello"));
        assert!(!config.uses_priority_queue("Reverse"));
        assert!(config.disable_publishing_responses);
    }

    #[test]
    fn test_disable_priority_queues() {
        let config = MqServerConfig::new().disable_priority_queues();
        assert!(!config.uses_priority_queue("Hello"));
    }

    #[test]
    fn test_publish_whitelists() {
        let config = MqServerConfig::new()
            .with_publish_responses_whitelist(["Hello"])
            .disable_publishing_to_outq();

        assert!(config.publishes_responses("Hello"));
        assert!(!config.publishes_responses("Reverse"));
        assert!(!config.publishes_to_outq("Hello"));

        let config = MqServerConfig::new()
            .with_publish_responses_whitelist(["Hello"])
            .with_disable_publishing_responses(true);
        assert!(!config.publishes_responses("Hello"));

        let config = MqServerConfig::new().with_publish_to_outq_whitelist(["Reverse"]);
        assert!(config.publishes_to_outq("Reverse"));
        assert!(!config.publishes_to_outq("Hello"));
    }

    #[test]
    fn test_filters_debug_without_closures() {
        let config = MqServerConfig::new().with_response_filter(|body| body);
        let debug = format!("{:?}", config.filters);
        assert!(debug.contains("request: false"));
        assert!(debug.contains("response: true"));
    }

    #[cfg(feature = "config")]
    mod from_env {
        use super::*;
        use core_config::FromEnv;

        const VARS: [&str; 10] = [
            "MQ_RETRY_COUNT",
            "MQ_KEEP_ALIVE_RETRY_AFTER_MS",
            "MQ_DISABLE_PRIORITY_QUEUES",
            "MQ_PRIORITY_QUEUES_WHITELIST",
            "MQ_DISABLE_PUBLISHING_RESPONSES",
            "MQ_PUBLISH_RESPONSES_WHITELIST",
            "MQ_DISABLE_PUBLISHING_TO_OUTQ",
            "MQ_PUBLISH_TO_OUTQ_WHITELIST",
            "MQ_CONTROL_TOPIC",
            "MQ_QUEUE_PREFIX",
        ];

        #[test]
        fn test_from_env_defaults() {
            temp_env::with_vars_unset(VARS, || {
                let config = MqServerConfig::from_env().unwrap();
                assert_eq!(config.retry_count, 1);
                assert_eq!(config.keep_alive_retry_after, Some(Duration::from_secs(1)));
                assert!(config.priority_queues_whitelist.is_none());
                assert!(config.publish_responses_whitelist.is_none());
                assert!(config.publish_to_outq_whitelist.is_none());
            });
        }

        #[test]
        fn test_from_env_publish_whitelists() {
            temp_env::with_vars(
                [
                    ("MQ_PUBLISH_RESPONSES_WHITELIST", Some("Hello")),
                    ("MQ_DISABLE_PUBLISHING_TO_OUTQ", None),
                    ("MQ_PUBLISH_TO_OUTQ_WHITELIST", Some("Reverse, ")),
                ],
                || {
                    let config = MqServerConfig::from_env().unwrap();
                    assert_eq!(
                        config.publish_responses_whitelist,
                        Some(vec!["Hello".to_string()])
                    );
                    assert_eq!(
                        config.publish_to_outq_whitelist,
                        Some(vec!["Reverse".to_string()])
                    );
                },
            );
        }

        #[test]
        fn test_from_env_disable_publishing_to_outq() {
            temp_env::with_vars(
                [
                    ("MQ_DISABLE_PUBLISHING_TO_OUTQ", Some("true")),
                    ("MQ_PUBLISH_TO_OUTQ_WHITELIST", Some("Reverse")),
                ],
                || {
                    let config = MqServerConfig::from_env().unwrap();
                    assert_eq!(config.publish_to_outq_whitelist, Some(Vec::new()));
                },
            );
        }

        #[test]
        fn test_from_env_custom_values() {
            temp_env::with_vars(
                [
                    ("MQ_RETRY_COUNT", Some("4")),
                    ("MQ_KEEP_ALIVE_RETRY_AFTER_MS", Some("off")),
                    ("MQ_DISABLE_PRIORITY_QUEUES", None),
                    ("MQ_PRIORITY_QUEUES_WHITELIST", Some("Hello, Reverse")),
                    ("MQ_DISABLE_PUBLISHING_RESPONSES", Some("true")),
                    ("MQ_CONTROL_TOPIC", Some("site1:topic:in")),
                    ("MQ_QUEUE_PREFIX", Some("site1:")),
                ],
                || {
                    let config = MqServerConfig::from_env().unwrap();
                    assert_eq!(config.retry_count, 4);
                    assert!(config.keep_alive_retry_after.is_none());
                    assert_eq!(
                        config.priority_queues_whitelist,
                        Some(vec!["Hello".to_string(), "Reverse".to_string()])
                    );
                    assert!(config.disable_publishing_responses);
                    assert_eq!(config.control_topic, "site1:topic:in");
                    assert_eq!(config.queue_prefix, "site1:");
                },
            );
        }

        #[test]
        fn test_from_env_disable_priority_wins() {
            temp_env::with_vars(
                [
                    ("MQ_DISABLE_PRIORITY_QUEUES", Some("1")),
                    ("MQ_PRIORITY_QUEUES_WHITELIST", Some("Hello")),
                ],
                || {
                    let config = MqServerConfig::from_env().unwrap();
                    assert_eq!(config.priority_queues_whitelist, Some(Vec::new()));
                },
            );
        }

        #[test]
        fn test_from_env_invalid_retry_count() {
            temp_env::with_var("MQ_RETRY_COUNT", Some("many"), || {
                let err = MqServerConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("MQ_RETRY_COUNT"));
            });
        }
    }
}
