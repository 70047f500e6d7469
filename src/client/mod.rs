//! Capability surface over the stream server.
//!
//! Producers, consumers and daemons depend on [`StreamClient`] only; no
//! concrete client type leaks into them. The required operations cover
//! streams and consumer groups. Everything else (pending/claim, sorted
//! sets, atomic reserve-and-append, plain key/value) is an optional
//! capability exposed through a nullable accessor, and dependents disable
//! or fall back when an accessor returns `None`.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::envelope::FieldMap;
use crate::error::StreamError;

pub use self::memory::MemoryStreamClient;
pub use self::redis::{connect, connect_with, RedisPoolConfig, RedisStreamClient};

/// One entry of a group's pending list.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Required stream/group operations plus nullable optional capabilities.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Append an entry; returns the server-assigned id. `max_len` asks for
    /// approximate trimming where the server supports it.
    async fn xadd(
        &self,
        stream: &str,
        max_len: Option<u64>,
        fields: &FieldMap,
    ) -> Result<String, StreamError>;

    /// Read up to `count` new entries for `consumer` in `group`, blocking up
    /// to `block_ms`. An empty result is a normal blocking timeout.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, FieldMap)>, StreamError>;

    /// Acknowledge ids; returns how many were actually pending.
    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError>;

    /// Create `group` on `stream` starting at `$`, creating the stream if
    /// missing. "Group already exists" is success.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Names of the groups on `stream`; empty when the stream is missing.
    async fn xgroup_names(&self, stream: &str) -> Result<Vec<String>, StreamError>;

    async fn xlen(&self, stream: &str) -> Result<u64, StreamError>;

    fn pending_ops(&self) -> Option<&dyn PendingOps> {
        None
    }

    fn sorted_set_ops(&self) -> Option<&dyn SortedSetOps> {
        None
    }

    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        None
    }

    fn kv_ops(&self) -> Option<&dyn KvOps> {
        None
    }
}

/// Pending-list inspection and claiming.
#[async_trait]
pub trait PendingOps: Send + Sync {
    /// Pending entries idle for at least `min_idle_ms`, oldest first,
    /// up to `count`.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingInfo>, StreamError>;

    /// Transfer ownership of `ids` (still idle past `min_idle_ms`) to
    /// `consumer`; returns the claimed entries with their fields.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<(String, FieldMap)>, StreamError>;
}

/// Sorted-set operations backing the retry scheduler.
#[async_trait]
pub trait SortedSetOps: Send + Sync {
    /// Whether pop-min is available; the retry daemon falls back to
    /// range+remove otherwise.
    fn supports_pop_min(&self) -> bool {
        true
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StreamError>;

    /// Remove and return up to `count` members with the smallest scores.
    async fn zpopmin(&self, key: &str, count: usize)
        -> Result<Vec<(String, i64)>, StreamError>;

    /// Members with score in `[0, max_score]`, ascending, up to `limit`.
    async fn zrangebyscore(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StreamError>;

    /// Remove members; returns how many existed.
    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StreamError>;
}

/// Server-atomic multi-step sections. The whole operation executes in one
/// round trip; callers never split the steps.
#[async_trait]
pub trait AtomicOps: Send + Sync {
    /// Reserve `key` with value `"PENDING"` and `ttl_sec` if unset; on a
    /// fresh reservation append `fields` to `stream` and overwrite the key
    /// with the new entry id, keeping the TTL. Returns the value stored
    /// under `key` after the operation (the new id, or whatever a prior
    /// reservation holds).
    async fn reserve_and_append(
        &self,
        key: &str,
        ttl_sec: u64,
        stream: &str,
        fields: &FieldMap,
    ) -> Result<Option<String>, StreamError>;
}

/// Plain key/value with TTLs, used for handler-level idempotency marks.
#[async_trait]
pub trait KvOps: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StreamError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> Result<(), StreamError>;
    /// Set only if unset; returns whether the reservation was taken.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool, StreamError>;
    async fn del(&self, key: &str) -> Result<(), StreamError>;
}
