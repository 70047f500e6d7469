//! Redis/Valkey implementation of the stream client over a bb8 pool.

use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::time::sleep;
use tracing::debug;

use crate::client::{AtomicOps, KvOps, PendingInfo, PendingOps, SortedSetOps, StreamClient};
use crate::envelope::FieldMap;
use crate::error::StreamError;

/// Connection pool tuning.
#[derive(Debug, Clone, Copy)]
pub struct RedisPoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    pub conn_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 32,
            min_idle: 2,
            conn_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Build a client with default pool settings, verified with a PING.
pub async fn connect(redis_url: &str) -> Result<RedisStreamClient, StreamError> {
    connect_with(redis_url, RedisPoolConfig::default()).await
}

/// Build a client with custom pool settings, verified with a PING
/// (retry with exponential backoff).
pub async fn connect_with(
    redis_url: &str,
    config: RedisPoolConfig,
) -> Result<RedisStreamClient, StreamError> {
    tracing::info!(
        max_size = config.max_size,
        min_idle = config.min_idle,
        conn_timeout_s = config.conn_timeout.as_secs(),
        "building redis pool"
    );

    let manager = RedisConnectionManager::new(redis_url).map_err(|e| {
        StreamError::Connection(format!("invalid redis url {}: {e}", redacted(redis_url)))
    })?;

    if config.max_size == 0 {
        return Err(StreamError::Config("pool max_size must be > 0".into()));
    }
    let min_idle = config.min_idle.max(1).min(config.max_size);
    let pool = Pool::builder()
        .max_size(config.max_size)
        .min_idle(Some(min_idle))
        .connection_timeout(config.conn_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .build(manager)
        .await
        .map_err(|e| StreamError::Connection(format!("failed to build redis pool: {e}")))?;

    verify_pool(&pool).await?;

    Ok(RedisStreamClient::new(pool))
}

const POOL_VERIFY_ATTEMPTS: u32 = 4;

/// Round-trip a PING through the freshly built pool so stream workers
/// never start their loops against a server that was never reachable.
/// The delay between attempts doubles from 200 ms.
async fn verify_pool(pool: &Pool<RedisConnectionManager>) -> Result<(), StreamError> {
    let mut delay = Duration::from_millis(200);
    let mut last_err = None;
    for attempt in 1..=POOL_VERIFY_ATTEMPTS {
        match ping(pool).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt < POOL_VERIFY_ATTEMPTS {
                    tracing::warn!(attempt, error = %e, "redis not reachable yet, retrying in {delay:?}");
                    sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| StreamError::Connection("pool verification failed".into())))
}

async fn ping(pool: &Pool<RedisConnectionManager>) -> Result<(), StreamError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| StreamError::Connection(format!("get() from pool: {e}")))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| StreamError::Connection(format!("PING failed: {e}")))?;
    Ok(())
}

/// Strip userinfo from a connection URL before it reaches a log line.
fn redacted(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://<redacted>@{host}"),
        None => url.to_string(),
    }
}

const RESERVE_AND_APPEND_LUA: &str = r"
local reserved = redis.call('SET', KEYS[1], 'PENDING', 'NX', 'EX', ARGV[1])
if reserved then
    local args = {'XADD', KEYS[2], '*'}
    for i = 2, #ARGV do
        args[#args + 1] = ARGV[i]
    end
    local id = redis.call(unpack(args))
    redis.call('SET', KEYS[1], id, 'XX', 'KEEPTTL')
    return id
end
return redis.call('GET', KEYS[1])
";

/// [`StreamClient`] over Redis/Valkey. All optional capabilities are
/// available.
#[derive(Clone)]
pub struct RedisStreamClient {
    pool: Pool<RedisConnectionManager>,
    reserve_and_append: redis::Script,
}

impl RedisStreamClient {
    pub fn new(pool: Pool<RedisConnectionManager>) -> Self {
        Self {
            pool,
            reserve_and_append: redis::Script::new(RESERVE_AND_APPEND_LUA),
        }
    }

    pub fn pool(&self) -> &Pool<RedisConnectionManager> {
        &self.pool
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, StreamError> {
        self.pool
            .get()
            .await
            .map_err(|e| StreamError::Connection(format!("get() from pool: {e}")))
    }
}

/// A blocking read that expires without data surfaces as one of several
/// error shapes depending on the server and protocol version.
fn is_block_timeout(err: &redis::RedisError) -> bool {
    let s = err.to_string().to_lowercase();
    s.contains("timeout")
        || s.contains("timed out")
        || s.contains("nil")
        || (s.contains("response") && s.contains("type"))
}

fn value_as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_u64(value: &redis::Value) -> Option<u64> {
    match value {
        redis::Value::Int(n) => Some(*n as u64),
        _ => value_as_string(value)?.parse().ok(),
    }
}

/// Parse `[[id, [k, v, k, v, ...]], ...]` entry arrays (XCLAIM/XRANGE shape).
fn parse_entries(value: &redis::Value) -> Vec<(String, FieldMap)> {
    let mut out = Vec::new();
    let redis::Value::Array(rows) = value else {
        return out;
    };
    for row in rows {
        let redis::Value::Array(parts) = row else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        let Some(id) = value_as_string(&parts[0]) else {
            continue;
        };
        let redis::Value::Array(kv) = &parts[1] else {
            continue;
        };
        let mut fields = FieldMap::new();
        for pair in kv.chunks(2) {
            if let (Some(k), Some(v)) = (
                pair.first().and_then(value_as_string),
                pair.get(1).and_then(value_as_string),
            ) {
                fields.push((k, v));
            }
        }
        out.push((id, fields));
    }
    out
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn xadd(
        &self,
        stream: &str,
        max_len: Option<u64>,
        fields: &FieldMap,
    ) -> Result<String, StreamError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(n) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(n);
        }
        cmd.arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        let id: String = cmd.query_async(&mut *conn).await?;
        Ok(id)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, FieldMap)>, StreamError> {
        let mut conn = self.conn().await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let result: Result<StreamReadReply, _> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if is_block_timeout(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for key in reply.keys {
            for message in key.ids {
                let mut fields = FieldMap::new();
                for (k, v) in &message.map {
                    if let Some(v) = value_as_string(v) {
                        fields.push((k.clone(), v));
                    }
                }
                out.push((message.id, fields));
            }
        }
        Ok(out)
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(()) => {
                debug!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(StreamError::ConsumerGroup(e.to_string())),
        }
    }

    async fn xgroup_names(&self, stream: &str) -> Result<Vec<String>, StreamError> {
        let mut conn = self.conn().await?;
        let result: Result<redis::streams::StreamInfoGroupsReply, _> =
            conn.xinfo_groups(stream).await;
        match result {
            Ok(reply) => Ok(reply.groups.into_iter().map(|g| g.name).collect()),
            Err(e) if e.to_string().contains("no such key") => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StreamError> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    fn pending_ops(&self) -> Option<&dyn PendingOps> {
        Some(self)
    }

    fn sorted_set_ops(&self) -> Option<&dyn SortedSetOps> {
        Some(self)
    }

    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        Some(self)
    }

    fn kv_ops(&self) -> Option<&dyn KvOps> {
        Some(self)
    }
}

#[async_trait]
impl PendingOps for RedisStreamClient {
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingInfo>, StreamError> {
        let mut conn = self.conn().await?;
        // XPENDING <stream> <group> IDLE <ms> - + <count>
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut *conn)
            .await?;

        let mut out = Vec::new();
        let redis::Value::Array(rows) = reply else {
            return Ok(out);
        };
        for row in &rows {
            let redis::Value::Array(parts) = row else {
                continue;
            };
            if parts.len() < 4 {
                continue;
            }
            let (Some(id), Some(consumer), Some(idle_ms), Some(delivery_count)) = (
                value_as_string(&parts[0]),
                value_as_string(&parts[1]),
                value_as_u64(&parts[2]),
                value_as_u64(&parts[3]),
            ) else {
                continue;
            };
            out.push(PendingInfo {
                id,
                consumer,
                idle_ms,
                delivery_count,
            });
        }
        Ok(out)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<(String, FieldMap)>, StreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in ids {
            cmd.arg(id);
        }
        let reply: redis::Value = cmd.query_async(&mut *conn).await?;
        Ok(parse_entries(&reply))
    }
}

#[async_trait]
impl SortedSetOps for RedisStreamClient {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zpopmin(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, i64)>, StreamError> {
        let mut conn = self.conn().await?;
        let popped: Vec<(String, f64)> = conn.zpopmin(key, count as isize).await?;
        Ok(popped
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StreamError> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, 0, max_score, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StreamError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrem(key, members).await?;
        Ok(removed)
    }
}

#[async_trait]
impl AtomicOps for RedisStreamClient {
    async fn reserve_and_append(
        &self,
        key: &str,
        ttl_sec: u64,
        stream: &str,
        fields: &FieldMap,
    ) -> Result<Option<String>, StreamError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.reserve_and_append.key(key);
        invocation.key(stream).arg(ttl_sec);
        for (k, v) in fields {
            invocation.arg(k).arg(v);
        }
        let stored: Option<String> = invocation.invoke_async(&mut *conn).await?;
        Ok(stored)
    }
}

#[async_trait]
impl KvOps for RedisStreamClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StreamError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key, value, ttl_sec).await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_sec: u64,
    ) -> Result<bool, StreamError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
