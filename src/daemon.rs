//! Retry daemon: moves due members from the retry sorted set back into
//! their target streams.
//!
//! Each tick drains members whose due time has passed, in ascending
//! due-time order, and re-appends their field maps. Ownership is
//! established by removal: a member is only forwarded after it has left
//! the sorted set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::StreamClient;
use crate::config::RetryDaemonConfig;
use crate::envelope::{now_ms, FieldMap};
use crate::error::StreamError;

const MIN_TICK: Duration = Duration::from_millis(25);

/// Wire format of a retry sorted-set member: the target stream plus the
/// exact field map to re-append at due time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryMember {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub fields: FieldMap,
}

/// Drains the retry sorted set on a jittered tick while running.
pub struct RetryDaemon {
    client: Arc<dyn StreamClient>,
    config: RetryDaemonConfig,
    running: Arc<AtomicBool>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RetryDaemon {
    pub fn new(client: Arc<dyn StreamClient>, config: RetryDaemonConfig) -> Self {
        Self {
            client,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the drain loop. A no-op when already running.
    pub async fn start(&self) -> Result<(), StreamError> {
        if self.client.sorted_set_ops().is_none() {
            return Err(StreamError::CapabilityMissing("sorted sets"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.client.clone(),
            self.config.clone(),
            self.running.clone(),
            cancel.clone(),
        ));
        *self.task.lock().unwrap() = Some((cancel, handle));
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self.task.lock().unwrap().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }
    }
}

async fn run_loop(
    client: Arc<dyn StreamClient>,
    config: RetryDaemonConfig,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    info!(zset = %config.retry_zset, target = %config.target_stream, "retry daemon started");
    while running.load(Ordering::SeqCst) {
        if let Err(e) = tick(client.as_ref(), &config).await {
            warn!(error = %e, "retry tick failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(jittered_tick(&config)) => {}
        }
    }
    info!("retry daemon stopped");
}

fn jittered_tick(config: &RetryDaemonConfig) -> Duration {
    let jitter = config.jitter_pct.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((config.tick_ms as f64 * factor) as u64).max(MIN_TICK)
}

/// One drain pass: collect owned due members, then forward them.
async fn tick(client: &dyn StreamClient, config: &RetryDaemonConfig) -> Result<(), StreamError> {
    let Some(zset) = client.sorted_set_ops() else {
        return Ok(());
    };
    let now = now_ms();
    let mut due: Vec<String> = Vec::new();

    if zset.supports_pop_min() {
        while due.len() < config.max_batch {
            let mut popped = zset.zpopmin(&config.retry_zset, 1).await?;
            if popped.is_empty() {
                break;
            }
            // A pop may return more than requested; extras go back.
            for (member, score) in popped.drain(1..) {
                zset.zadd(&config.retry_zset, &member, score).await?;
            }
            let Some((member, score)) = popped.pop() else {
                break;
            };
            if score > now {
                zset.zadd(&config.retry_zset, &member, score).await?;
                break;
            }
            due.push(member);
        }
    } else {
        let members = zset
            .zrangebyscore(&config.retry_zset, now, config.max_batch)
            .await?;
        for member in members {
            // Only members this daemon actually removed are owned.
            let removed = zset
                .zrem(&config.retry_zset, std::slice::from_ref(&member))
                .await?;
            if removed > 0 {
                due.push(member);
            }
        }
    }

    if due.is_empty() {
        return Ok(());
    }
    debug!(count = due.len(), "forwarding due retries");

    for member in due {
        match serde_json::from_str::<RetryMember>(&member) {
            Ok(retry) => {
                let target = retry.stream.as_deref().unwrap_or(&config.target_stream);
                if let Err(e) = client.xadd(target, None, &retry.fields).await {
                    error!(stream = %target, error = %e, "failed to re-append due retry; member dropped");
                }
            }
            Err(e) => {
                error!(error = %e, "unparseable retry member dropped");
            }
        }
    }
    Ok(())
}
