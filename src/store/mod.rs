//! Counter/cache store abstraction.
//!
//! The rate limiter, response cache, monitor and session escalation all
//! share mutable state through this trait instead of process-wide maps.
//! Every method is a single atomic operation against the backing store,
//! so callers never read-modify-write and the pipeline stays correct
//! whether the store is in-process or remote.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::Duration;

/// TTL for keys that must stay until explicitly deleted.
pub const NO_EXPIRY: Duration = Duration::MAX;

/// Key-value store with TTL and atomic counter primitives.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Backend name for health output.
    fn name(&self) -> &str;

    /// Atomically add `delta` to the counter at `key` and return the new
    /// value. A missing or expired key starts at zero and receives `ttl`;
    /// an existing key keeps its original expiry. [`NO_EXPIRY`] keeps the
    /// key until it is deleted.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> anyhow::Result<i64>;

    /// Atomically raise the counter at `key` to `value` if larger.
    /// Returns the stored value afterwards.
    async fn fetch_max(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<i64>;

    /// Atomically lower the counter at `key` to `value` if smaller.
    /// Returns the stored value afterwards.
    async fn fetch_min(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<i64>;

    /// Current counter value, zero when absent or expired.
    async fn counter(&self, key: &str) -> anyhow::Result<i64>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Remove every key starting with `prefix`. Returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize>;

    /// Snapshot of live counters whose key starts with `prefix`.
    async fn counters_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, i64)>>;

    async fn health_check(&self) -> bool;
}
