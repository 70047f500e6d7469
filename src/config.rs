//! Configuration for producers, consumers and daemons.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Idempotency key for producer-side de-duplication.
pub(crate) fn producer_idempotency_key(stream: &str, kind: &str, key: &str) -> String {
    format!("idempotency:{stream}:{kind}:{key}")
}

/// Idempotency key for handler-side de-duplication.
pub(crate) fn consumed_key(stream: &str, key: &str) -> String {
    format!("consumed:{stream}:{key}")
}

/// Producer-side de-duplication window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerIdempotency {
    pub ttl_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Target stream name.
    pub stream: String,
    /// `type` header applied when a send names none. Falls back to `"msg"`.
    pub default_kind: Option<String>,
    /// Approximate MAXLEN trimming on append, when set.
    pub max_len: Option<u64>,
    pub idempotency: Option<ProducerIdempotency>,
}

impl ProducerConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            default_kind: None,
            max_len: None,
            idempotency: None,
        }
    }

    pub fn with_default_kind(mut self, kind: impl Into<String>) -> Self {
        self.default_kind = Some(kind.into());
        self
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn with_idempotency(mut self, ttl_sec: u64) -> Self {
        self.idempotency = Some(ProducerIdempotency { ttl_sec });
        self
    }
}

/// Read-batch shape for the consumer loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub count: usize,
    pub block_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            count: 16,
            block_ms: 2000,
        }
    }
}

/// Pending-entry claim loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    pub enabled: bool,
    /// Idle threshold before a delivery counts as abandoned.
    pub min_idle_ms: u64,
    pub max_per_tick: usize,
    pub interval_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_idle_ms: 60_000,
            max_per_tick: 128,
            interval_ms: 1000,
        }
    }
}

/// How retries re-enter the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// Schedule on the retry sorted set; a retry daemon re-injects at due time.
    Zset,
    /// Re-append to the stream immediately, ignoring the computed delay.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    pub mode: SchedulingMode,
    /// Retry sorted-set name; defaults to `"<stream>:retry"`.
    pub retry_zset: Option<String>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::Zset,
            retry_zset: None,
        }
    }
}

/// Handler-level de-duplication windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerIdempotency {
    pub pending_ttl_sec: u64,
    pub done_ttl_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    /// Consumer name within the group; generated as `worker-<uuid>` when
    /// left unset.
    pub consumer: String,
    pub scheduling: SchedulingConfig,
    pub batch: BatchConfig,
    pub pel_claim: ClaimConfig,
    pub idempotency: Option<ConsumerIdempotency>,
}

impl ConsumerConfig {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: format!("worker-{}", Uuid::new_v4()),
            scheduling: SchedulingConfig::default(),
            batch: BatchConfig::default(),
            pel_claim: ClaimConfig::default(),
            idempotency: None,
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingConfig) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_pel_claim(mut self, pel_claim: ClaimConfig) -> Self {
        self.pel_claim = pel_claim;
        self
    }

    pub fn with_idempotency(mut self, pending_ttl_sec: u64, done_ttl_sec: u64) -> Self {
        self.idempotency = Some(ConsumerIdempotency {
            pending_ttl_sec,
            done_ttl_sec,
        });
        self
    }

    pub fn retry_zset(&self) -> String {
        self.scheduling
            .retry_zset
            .clone()
            .unwrap_or_else(|| format!("{}:retry", self.stream))
    }

    pub fn dlq_stream(&self) -> String {
        format!("{}:dlq", self.stream)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDaemonConfig {
    /// Sorted set to drain.
    pub retry_zset: String,
    /// Stream to append to when a member names no target.
    pub target_stream: String,
    pub max_batch: usize,
    pub tick_ms: u64,
    pub jitter_pct: f64,
}

impl RetryDaemonConfig {
    pub fn new(retry_zset: impl Into<String>, target_stream: impl Into<String>) -> Self {
        Self {
            retry_zset: retry_zset.into(),
            target_stream: target_stream.into(),
            max_batch: 256,
            tick_ms: 250,
            jitter_pct: 0.2,
        }
    }

    pub fn with_tick_ms(mut self, tick_ms: u64) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }
}

/// Standalone pending sweeper: claims abandoned deliveries for `consumer`
/// and leaves processing to that consumer's own loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub min_idle_ms: u64,
    pub max_per_tick: usize,
    pub interval_ms: u64,
}

impl SweeperConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            min_idle_ms: 60_000,
            max_per_tick: 128,
            interval_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_defaults_match_contract() {
        let config = ConsumerConfig::new("jobs", "workers");
        assert_eq!(config.batch.count, 16);
        assert_eq!(config.batch.block_ms, 2000);
        assert!(config.pel_claim.enabled);
        assert_eq!(config.pel_claim.max_per_tick, 128);
        assert_eq!(config.pel_claim.interval_ms, 1000);
        assert_eq!(config.scheduling.mode, SchedulingMode::Zset);
        assert!(config.consumer.starts_with("worker-"));
    }

    #[test]
    fn key_names_follow_contract() {
        let config = ConsumerConfig::new("jobs", "workers");
        assert_eq!(config.retry_zset(), "jobs:retry");
        assert_eq!(config.dlq_stream(), "jobs:dlq");
        assert_eq!(
            producer_idempotency_key("jobs", "email", "k1"),
            "idempotency:jobs:email:k1"
        );
        assert_eq!(consumed_key("jobs", "k1"), "consumed:jobs:k1");

        let custom = ConsumerConfig::new("jobs", "workers").with_scheduling(SchedulingConfig {
            mode: SchedulingMode::Zset,
            retry_zset: Some("custom:retry".into()),
        });
        assert_eq!(custom.retry_zset(), "custom:retry");
    }

    #[test]
    fn daemon_defaults_match_contract() {
        let config = RetryDaemonConfig::new("jobs:retry", "jobs");
        assert_eq!(config.max_batch, 256);
        assert_eq!(config.tick_ms, 250);
        assert!((config.jitter_pct - 0.2).abs() < f64::EPSILON);
    }
}
