//! Redis-backed broker.
//!
//! Queues are Redis lists (`LPUSH` to publish, `RPOP` to consume, so each list
//! is FIFO) and notifications use `PUBLISH`/`SUBSCRIBE`. Queue commands check
//! a connection out of an r2d2 pool. A subscription blocks its socket for as
//! long as it lives, so it gets a dedicated connection outside the pool.

use crate::broker::{FailoverHook, MessageBroker, SubscriptionControl, SubscriptionEvent};
use crate::error::MqError;
use crate::retry::{retry_with_backoff, RetryConfig};
use r2d2::{Pool, PooledConnection};
use redis::Client;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pooled connections shared by the worker threads
pub const DEFAULT_POOL_SIZE: u32 = 16;

/// How long a command waits for a pooled connection
pub const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisBroker {
    client: Client,
    pool: Pool<Client>,
    failover_hooks: Mutex<Vec<FailoverHook>>,
}

impl RedisBroker {
    /// Create a broker for a Redis URL (e.g., "redis://127.0.0.1:6379").
    ///
    /// Does not connect; the first command does.
    pub fn new(url: &str) -> Result<Self, MqError> {
        Self::with_pool(url, DEFAULT_POOL_SIZE, DEFAULT_POOL_TIMEOUT)
    }

    /// Create a broker with a custom pool size and checkout timeout
    pub fn with_pool(url: &str, max_size: u32, timeout: Duration) -> Result<Self, MqError> {
        let client = Client::open(url)?;
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(timeout)
            .build_unchecked(client.clone());

        Ok(Self {
            client,
            pool,
            failover_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Create a broker and verify the server answers `PING`
    pub fn connect(url: &str) -> Result<Self, MqError> {
        info!("Attempting to connect to Redis");
        let broker = Self::new(url)?;
        broker.ping()?;
        info!("Successfully connected to Redis");
        Ok(broker)
    }

    /// Connect, retrying with exponential backoff
    pub fn connect_with_retry(url: &str, retry: Option<RetryConfig>) -> Result<Self, MqError> {
        let retry = retry.unwrap_or_default();
        retry_with_backoff(|| Self::connect(url), &retry)
    }

    pub fn ping(&self) -> Result<(), MqError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query(&mut conn)?;
        Ok(())
    }

    /// Signal a topology change (e.g. sentinel promoted a replica).
    ///
    /// Runs every hook registered through [`MessageBroker::on_failover`].
    pub fn failover(&self) {
        let hooks: Vec<FailoverHook> = match self.failover_hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => return,
        };

        warn!(hooks = hooks.len(), "Redis failover signalled");
        for hook in hooks {
            hook();
        }
    }

    /// Connections currently held by the pool, idle or checked out
    pub fn pooled_connections(&self) -> u32 {
        self.pool.state().connections
    }

    fn connection(&self) -> Result<PooledConnection<Client>, MqError> {
        Ok(self.pool.get()?)
    }
}

impl MessageBroker for RedisBroker {
    fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MqError> {
        let mut conn = self.connection()?;
        redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query::<()>(&mut conn)?;
        Ok(())
    }

    fn get(&self, queue: &str) -> Result<Option<Vec<u8>>, MqError> {
        let mut conn = self.connection()?;
        let payload: Option<Vec<u8>> = redis::cmd("RPOP").arg(queue).query(&mut conn)?;
        Ok(payload)
    }

    fn notify(&self, topic: &str, payload: &str) -> Result<(), MqError> {
        let mut conn = self.connection()?;
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query::<()>(&mut conn)?;
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        on_event: &mut dyn FnMut(SubscriptionEvent) -> SubscriptionControl,
    ) -> Result<(), MqError> {
        let mut conn = self.client.get_connection()?;
        let mut pubsub = conn.as_pubsub();
        pubsub.subscribe(topic)?;
        debug!(topic = %topic, "Subscribed to Redis topic");

        if on_event(SubscriptionEvent::Subscribed) == SubscriptionControl::Unsubscribe {
            pubsub.unsubscribe(topic)?;
            return Ok(());
        }

        loop {
            let msg = pubsub.get_message()?;
            let payload: String = msg.get_payload()?;

            if on_event(SubscriptionEvent::Message(payload)) == SubscriptionControl::Unsubscribe {
                pubsub.unsubscribe(topic)?;
                debug!(topic = %topic, "Unsubscribed from Redis topic");
                return Ok(());
            }
        }
    }

    fn queue_len(&self, queue: &str) -> Result<usize, MqError> {
        let mut conn = self.connection()?;
        let len: usize = redis::cmd("LLEN").arg(queue).query(&mut conn)?;
        Ok(len)
    }

    fn on_failover(&self, hook: FailoverHook) {
        if let Ok(mut hooks) = self.failover_hooks.lock() {
            hooks.push(hook);
        }
    }
}
