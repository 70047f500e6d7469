//! Standalone pending sweeper.
//!
//! Operational variant of the in-worker claim loop: it only transfers
//! long-idle deliveries to the configured consumer and leaves processing
//! to that consumer's own read pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::StreamClient;
use crate::config::SweeperConfig;
use crate::error::StreamError;

pub struct PendingSweeper {
    client: Arc<dyn StreamClient>,
    config: SweeperConfig,
    running: Arc<AtomicBool>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PendingSweeper {
    pub fn new(client: Arc<dyn StreamClient>, config: SweeperConfig) -> Self {
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

    pub async fn start(&self) -> Result<(), StreamError> {
        if self.client.pending_ops().is_none() {
            return Err(StreamError::CapabilityMissing("pending operations"));
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
    config: SweeperConfig,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    info!(
        stream = %config.stream,
        group = %config.group,
        consumer = %config.consumer,
        "pending sweeper started"
    );
    let interval = Duration::from_millis(config.interval_ms);

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let Some(pending_ops) = client.pending_ops() else {
            break;
        };

        let pending = match pending_ops
            .pending(
                &config.stream,
                &config.group,
                config.min_idle_ms,
                config.max_per_tick,
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "pending lookup failed");
                continue;
            }
        };
        if pending.is_empty() {
            continue;
        }

        let ids: Vec<String> = pending.iter().map(|p| p.id.clone()).collect();
        match pending_ops
            .claim(
                &config.stream,
                &config.group,
                &config.consumer,
                config.min_idle_ms,
                &ids,
            )
            .await
        {
            Ok(claimed) if !claimed.is_empty() => {
                info!(
                    count = claimed.len(),
                    consumer = %config.consumer,
                    "swept idle deliveries"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "claim failed"),
        }
    }
    debug!("pending sweeper stopped");
}
