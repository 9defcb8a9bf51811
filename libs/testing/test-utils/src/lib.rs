//! Shared test utilities for the MQ crates
//!
//! This crate provides reusable test infrastructure:
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic queue prefixes and names (always available)
//! - `wait_until`: Polling for outcomes produced by background threads (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `all`: Enables all broker test infrastructure
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let url = redis.connection_string().to_string();
//!     let prefix = builder.queue_prefix();
//! }
//! ```

use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `predicate` until it returns true or `timeout` elapses.
///
/// Returns the final value of the predicate.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    predicate()
}

/// Builder for test data with deterministic naming
///
/// Tests sharing a broker use distinct queue prefixes so they never see each
/// other's messages.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_retry_to_dlq");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue prefix unique to this builder, e.g. `"test-12345:"`
    pub fn queue_prefix(&self) -> String {
        format!("test-{}:", self.seed)
    }

    /// Control topic unique to this builder
    pub fn control_topic(&self) -> String {
        format!("test-{}:topic:in", self.seed)
    }

    /// Generate a unique name for testing
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let name = builder.name("queue", "main");
    /// assert!(name.starts_with("test-queue-"));
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}
