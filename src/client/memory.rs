//! In-memory stream client used by tests and examples.
//!
//! Implements every capability atomically under a single lock, which makes
//! it a faithful stand-in for the server-atomic primitives the core relies
//! on. Capabilities can be switched off one by one to exercise the
//! degraded paths. The lock is never held across an await; the blocking
//! read is a short poll loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::client::{AtomicOps, KvOps, PendingInfo, PendingOps, SortedSetOps, StreamClient};
use crate::envelope::{now_ms, FieldMap};
use crate::error::StreamError;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    fields: FieldMap,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<Entry>,
}

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
    index: usize,
}

#[derive(Debug, Default)]
struct GroupState {
    next_index: usize,
    pending: HashMap<String, PendingState>,
}

#[derive(Debug)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

#[derive(Default)]
struct MemoryState {
    seq: u64,
    streams: HashMap<String, StreamState>,
    groups: HashMap<(String, String), GroupState>,
    zsets: HashMap<String, Vec<(String, i64)>>,
    kv: HashMap<String, KvEntry>,
}

impl MemoryState {
    fn append(&mut self, stream: &str, fields: &FieldMap) -> String {
        self.seq += 1;
        let id = format!("{}-{}", now_ms(), self.seq);
        self.streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(Entry {
                id: id.clone(),
                fields: fields.clone(),
            });
        id
    }

    fn kv_get(&mut self, key: &str) -> Option<String> {
        match self.kv.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                self.kv.remove(key);
                None
            }
            None => None,
        }
    }

    fn kv_set(&mut self, key: &str, value: &str, ttl_sec: u64) {
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_sec)),
            },
        );
    }
}

#[derive(Clone, Copy)]
struct Capabilities {
    pending: bool,
    sorted_sets: bool,
    atomic: bool,
    kv: bool,
    pop_min: bool,
}

/// In-memory [`StreamClient`] with all capabilities enabled by default.
#[derive(Clone)]
pub struct MemoryStreamClient {
    state: Arc<Mutex<MemoryState>>,
    caps: Capabilities,
}

impl Default for MemoryStreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            caps: Capabilities {
                pending: true,
                sorted_sets: true,
                atomic: true,
                kv: true,
                pop_min: true,
            },
        }
    }

    pub fn without_pending(mut self) -> Self {
        self.caps.pending = false;
        self
    }

    pub fn without_sorted_sets(mut self) -> Self {
        self.caps.sorted_sets = false;
        self
    }

    pub fn without_atomic(mut self) -> Self {
        self.caps.atomic = false;
        self
    }

    pub fn without_kv(mut self) -> Self {
        self.caps.kv = false;
        self
    }

    pub fn without_pop_min(mut self) -> Self {
        self.caps.pop_min = false;
        self
    }

    /// Every entry currently in `stream`, in append order.
    pub fn entries(&self, stream: &str) -> Vec<(String, FieldMap)> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| (e.id.clone(), e.fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Size of the group's pending list.
    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Number of members in a sorted set.
    pub fn zset_len(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.zsets.get(key).map(|z| z.len()).unwrap_or(0)
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, FieldMap)>, StreamError> {
        let mut state = self.state.lock().unwrap();
        let entries: Vec<Entry> = state
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default();
        let group_key = (stream.to_string(), group.to_string());
        let group_state = state
            .groups
            .get_mut(&group_key)
            .ok_or_else(|| StreamError::ConsumerGroup(format!("no group '{group}' on '{stream}'")))?;

        let mut out = Vec::new();
        while group_state.next_index < entries.len() && out.len() < count {
            let index = group_state.next_index;
            let entry = &entries[index];
            group_state.pending.insert(
                entry.id.clone(),
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                    index,
                },
            );
            out.push((entry.id.clone(), entry.fields.clone()));
            group_state.next_index += 1;
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn xadd(
        &self,
        stream: &str,
        _max_len: Option<u64>,
        fields: &FieldMap,
    ) -> Result<String, StreamError> {
        // Trimming is approximate by contract; the fake keeps everything.
        let mut state = self.state.lock().unwrap();
        Ok(state.append(stream, fields))
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, FieldMap)>, StreamError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let batch = self.try_read_group(stream, group, consumer, count)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        let mut state = self.state.lock().unwrap();
        let group_key = (stream.to_string(), group.to_string());
        let Some(group_state) = state.groups.get_mut(&group_key) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        let len = state
            .streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .len();
        // Start at "$": only entries appended after creation are delivered.
        state
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_insert_with(|| GroupState {
                next_index: len,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn xgroup_names(&self, stream: &str) -> Result<Vec<String>, StreamError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .keys()
            .filter(|(s, _)| s == stream)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StreamError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    fn pending_ops(&self) -> Option<&dyn PendingOps> {
        self.caps.pending.then_some(self as &dyn PendingOps)
    }

    fn sorted_set_ops(&self) -> Option<&dyn SortedSetOps> {
        self.caps.sorted_sets.then_some(self as &dyn SortedSetOps)
    }

    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        self.caps.atomic.then_some(self as &dyn AtomicOps)
    }

    fn kv_ops(&self) -> Option<&dyn KvOps> {
        self.caps.kv.then_some(self as &dyn KvOps)
    }
}

#[async_trait]
impl PendingOps for MemoryStreamClient {
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingInfo>, StreamError> {
        let state = self.state.lock().unwrap();
        let group_key = (stream.to_string(), group.to_string());
        let Some(group_state) = state.groups.get(&group_key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &PendingState)> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.delivered_at.elapsed().as_millis() as u64 >= min_idle_ms)
            .collect();
        entries.sort_by_key(|(_, p)| p.index);
        Ok(entries
            .into_iter()
            .take(count)
            .map(|(id, p)| PendingInfo {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle_ms: p.delivered_at.elapsed().as_millis() as u64,
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<(String, FieldMap)>, StreamError> {
        let mut state = self.state.lock().unwrap();
        let entries: HashMap<String, FieldMap> = state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| (e.id.clone(), e.fields.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let group_key = (stream.to_string(), group.to_string());
        let Some(group_state) = state.groups.get_mut(&group_key) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = group_state.pending.get_mut(id) else {
                continue;
            };
            if (pending.delivered_at.elapsed().as_millis() as u64) < min_idle_ms {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = Instant::now();
                    pending.delivery_count += 1;
                    claimed.push((id.clone(), fields.clone()));
                }
                // Entry no longer in the stream; drop the dangling reference.
                None => {
                    group_state.pending.remove(id);
                }
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl SortedSetOps for MemoryStreamClient {
    fn supports_pop_min(&self) -> bool {
        self.caps.pop_min
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        let zset = state.zsets.entry(key.to_string()).or_default();
        if let Some(existing) = zset.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
        } else {
            zset.push((member.to_string(), score));
        }
        Ok(())
    }

    async fn zpopmin(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, i64)>, StreamError> {
        let mut state = self.state.lock().unwrap();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(Vec::new());
        };
        zset.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let take = count.min(zset.len());
        Ok(zset.drain(..take).collect())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StreamError> {
        let state = self.state.lock().unwrap();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(String, i64)> = zset
            .iter()
            .filter(|(_, score)| *score <= max_score)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m).collect())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StreamError> {
        let mut state = self.state.lock().unwrap();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|(m, _)| !members.contains(m));
        Ok((before - zset.len()) as u64)
    }
}

#[async_trait]
impl AtomicOps for MemoryStreamClient {
    async fn reserve_and_append(
        &self,
        key: &str,
        ttl_sec: u64,
        stream: &str,
        fields: &FieldMap,
    ) -> Result<Option<String>, StreamError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.kv_get(key) {
            return Ok(Some(existing));
        }
        state.kv_set(key, "PENDING", ttl_sec);
        let id = state.append(stream, fields);
        state.kv_set(key, &id, ttl_sec);
        Ok(Some(id))
    }
}

#[async_trait]
impl KvOps for MemoryStreamClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StreamError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.kv_get(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        state.kv_set(key, value, ttl_sec);
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_sec: u64,
    ) -> Result<bool, StreamError> {
        let mut state = self.state.lock().unwrap();
        if state.kv_get(key).is_some() {
            return Ok(false);
        }
        state.kv_set(key, value, ttl_sec);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        state.kv.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> FieldMap {
        vec![("value".to_string(), v.to_string())]
    }

    #[tokio::test]
    async fn group_starts_at_end_of_stream() {
        let client = MemoryStreamClient::new();
        client.xadd("s", None, &fields("before")).await.unwrap();
        client.xgroup_create("s", "g").await.unwrap();
        client.xadd("s", None, &fields("after")).await.unwrap();

        let batch = client.xread_group("s", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1, fields("after"));
    }

    #[tokio::test]
    async fn delivered_entries_sit_in_pending_until_acked() {
        let client = MemoryStreamClient::new();
        client.xgroup_create("s", "g").await.unwrap();
        client.xadd("s", None, &fields("a")).await.unwrap();

        let batch = client.xread_group("s", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(client.pending_len("s", "g"), 1);

        let acked = client
            .xack("s", "g", &[batch[0].0.clone()])
            .await
            .unwrap();
        assert_eq!(acked, 1);
        assert_eq!(client.pending_len("s", "g"), 0);

        // Double-ack counts nothing.
        let acked = client.xack("s", "g", &[batch[0].0.clone()]).await.unwrap();
        assert_eq!(acked, 0);
    }

    #[tokio::test]
    async fn claim_respects_idle_threshold() {
        let client = MemoryStreamClient::new();
        client.xgroup_create("s", "g").await.unwrap();
        client.xadd("s", None, &fields("a")).await.unwrap();
        let batch = client.xread_group("s", "g", "dead", 10, 10).await.unwrap();
        let id = batch[0].0.clone();

        let ops = client.pending_ops().unwrap();
        // Too fresh to claim.
        let claimed = ops
            .claim("s", "g", "c2", 60_000, std::slice::from_ref(&id))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let pending = ops.pending("s", "g", 20, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "dead");

        let claimed = ops
            .claim("s", "g", "c2", 20, std::slice::from_ref(&id))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = ops.pending("s", "g", 0, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn zset_orders_by_score_then_member() {
        let client = MemoryStreamClient::new();
        let z = client.sorted_set_ops().unwrap();
        z.zadd("z", "b", 200).await.unwrap();
        z.zadd("z", "a", 100).await.unwrap();
        z.zadd("z", "c", 100).await.unwrap();

        let due = z.zrangebyscore("z", 150, 10).await.unwrap();
        assert_eq!(due, vec!["a".to_string(), "c".to_string()]);

        let popped = z.zpopmin("z", 1).await.unwrap();
        assert_eq!(popped, vec![("a".to_string(), 100)]);
        assert_eq!(client.zset_len("z"), 2);

        let removed = z.zrem("z", &["b".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn kv_nx_reserves_once() {
        let client = MemoryStreamClient::new();
        let kv = client.kv_ops().unwrap();
        assert!(kv.set_nx_ex("k", "first", 60).await.unwrap());
        assert!(!kv.set_nx_ex("k", "second", 60).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("first"));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reserve_and_append_is_first_writer_wins() {
        let client = MemoryStreamClient::new();
        let atomic = client.atomic_ops().unwrap();
        let first = atomic
            .reserve_and_append("idem", 60, "s", &fields("a"))
            .await
            .unwrap()
            .unwrap();
        let second = atomic
            .reserve_and_append("idem", 60, "s", &fields("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(client.entries("s").len(), 1);
    }

    #[tokio::test]
    async fn disabled_capabilities_return_none() {
        let client = MemoryStreamClient::new()
            .without_pending()
            .without_sorted_sets()
            .without_atomic()
            .without_kv();
        assert!(client.pending_ops().is_none());
        assert!(client.sorted_set_ops().is_none());
        assert!(client.atomic_ops().is_none());
        assert!(client.kv_ops().is_none());
    }
}
