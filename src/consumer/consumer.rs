//! Consumer worker: group-read loop, dispatch, terminal actions and the
//! pending-claim recovery loop.
//!
//! Every delivery handed to the handler reaches exactly one terminal:
//! acknowledge, retry (scheduled through the retry sorted set and acked),
//! or dead-letter (appended to `<stream>:dlq` and acked). The original
//! entry is acknowledged in all three cases.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::StreamClient;
use crate::config::{consumed_key, ConsumerConfig, SchedulingMode};
use crate::consumer::handler::{Handler, MessageContext};
use crate::daemon::RetryMember;
use crate::envelope::{now_ms, Envelope, EnvelopeCodec, FieldMap, JsonFieldCodec};
use crate::error::StreamError;
use crate::retry::{HandlerError, RetryPolicy, Terminal};

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(250);
const DRAIN_POLL: Duration = Duration::from_millis(25);
const CONTESTED_RESCHEDULE_DELAY: Duration = Duration::from_millis(500);

/// Shutdown behavior for [`ConsumerWorker::stop`].
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Wait for in-flight processing to finish before returning.
    pub drain: bool,
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            drain: true,
            timeout: Duration::from_secs(10),
        }
    }
}

struct WorkerShared {
    client: Arc<dyn StreamClient>,
    codec: Arc<dyn EnvelopeCodec>,
    handler: Arc<dyn Handler>,
    retry_policy: RetryPolicy,
    config: ConsumerConfig,
    running: AtomicBool,
    in_flight: AtomicUsize,
}

struct WorkerTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// One consumer within a group. Processing is strictly sequential per
/// worker; run several workers with distinct consumer names for
/// parallelism.
pub struct ConsumerWorker {
    shared: Arc<WorkerShared>,
    tasks: Mutex<Option<WorkerTasks>>,
}

impl ConsumerWorker {
    pub fn new(
        client: Arc<dyn StreamClient>,
        config: ConsumerConfig,
        handler: Arc<dyn Handler>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self::with_codec(client, config, handler, retry_policy, Arc::new(JsonFieldCodec))
    }

    pub fn with_codec(
        client: Arc<dyn StreamClient>,
        config: ConsumerConfig,
        handler: Arc<dyn Handler>,
        retry_policy: RetryPolicy,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                client,
                codec,
                handler,
                retry_policy,
                config,
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            tasks: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Messages currently being processed (0 or 1 per worker).
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Ensure the consumer group exists, then spawn the read loop and,
    /// when enabled and supported, the claim loop. A no-op when already
    /// running; only a group-ensure failure surfaces synchronously.
    pub async fn start(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        let config = &shared.config;

        let groups = shared.client.xgroup_names(&config.stream).await?;
        if !groups.iter().any(|g| g == &config.group) {
            shared.client.xgroup_create(&config.stream, &config.group).await?;
        }

        if shared.running.swap(true, Ordering::SeqCst) {
            debug!(consumer = %config.consumer, "worker already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut handles = vec![tokio::spawn(read_loop(shared.clone(), cancel.clone()))];

        if config.pel_claim.enabled {
            if shared.client.pending_ops().is_some() {
                handles.push(tokio::spawn(claim_loop(shared.clone(), cancel.clone())));
            } else {
                info!("client lacks pending ops; claim loop disabled");
            }
        }

        *self.tasks.lock().unwrap() = Some(WorkerTasks { cancel, handles });
        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "consumer worker started"
        );
        Ok(())
    }

    /// Cooperative shutdown. Loops observe the flag between iterations;
    /// the current message's handler runs to completion.
    pub async fn stop(&self, opts: StopOptions) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks = self.tasks.lock().unwrap().take();
        let Some(WorkerTasks { cancel, handles }) = tasks else {
            return;
        };
        cancel.cancel();

        if opts.drain {
            let deadline = Instant::now() + opts.timeout;
            while self.shared.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(100));
            let _ = tokio::time::timeout(remaining, futures::future::join_all(handles)).await;
        }
        info!(consumer = %self.shared.config.consumer, "consumer worker stopped");
    }
}

async fn read_loop(shared: Arc<WorkerShared>, cancel: CancellationToken) {
    let config = &shared.config;
    debug!(consumer = %config.consumer, "read loop started");

    while shared.running.load(Ordering::SeqCst) {
        let read = shared.client.xread_group(
            &config.stream,
            &config.group,
            &config.consumer,
            config.batch.count,
            config.batch.block_ms,
        );
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read => result,
        };

        match batch {
            Ok(messages) => {
                for (id, fields) in messages {
                    if !shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    process_message(&shared, &id, &fields).await;
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Err(e) => {
                error!(error = %e, "group read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!(consumer = %config.consumer, "read loop stopped");
}

/// Reclaim deliveries left idle past the threshold and run them through
/// the normal pipeline.
async fn claim_loop(shared: Arc<WorkerShared>, cancel: CancellationToken) {
    let config = &shared.config;
    let interval = Duration::from_millis(config.pel_claim.interval_ms);
    debug!(consumer = %config.consumer, "claim loop started");

    while shared.running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let Some(pending_ops) = shared.client.pending_ops() else {
            break;
        };

        let pending = match pending_ops
            .pending(
                &config.stream,
                &config.group,
                config.pel_claim.min_idle_ms,
                config.pel_claim.max_per_tick,
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
        let claimed = match pending_ops
            .claim(
                &config.stream,
                &config.group,
                &config.consumer,
                config.pel_claim.min_idle_ms,
                &ids,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(error = %e, "claim failed");
                continue;
            }
        };
        if claimed.is_empty() {
            continue;
        }
        info!(count = claimed.len(), consumer = %config.consumer, "reclaimed idle deliveries");

        for (id, fields) in claimed {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            shared.in_flight.fetch_add(1, Ordering::SeqCst);
            process_message(&shared, &id, &fields).await;
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
    debug!(consumer = %config.consumer, "claim loop stopped");
}

async fn process_message(shared: &Arc<WorkerShared>, id: &str, fields: &FieldMap) {
    let config = &shared.config;

    let envelope = match shared.codec.decode(fields) {
        Ok(envelope) => envelope,
        // A malformed entry cannot be repaired by retrying.
        Err(e) => {
            error!(message_id = %id, error = %e, "undecodable entry acknowledged and lost");
            ack_quietly(shared, id).await;
            return;
        }
    };

    let mut reservation: Option<String> = None;
    if let (Some(idem), Some(kv), Some(key)) = (
        &config.idempotency,
        shared.client.kv_ops(),
        envelope.headers.key.as_ref(),
    ) {
        let consumed = consumed_key(&config.stream, key);
        let mark = format!("PENDING:{}", config.consumer);
        match kv.set_nx_ex(&consumed, &mark, idem.pending_ttl_sec).await {
            Ok(true) => reservation = Some(consumed),
            Ok(false) => {
                let current = kv.get(&consumed).await.ok().flatten();
                if current.as_deref() == Some("DONE") {
                    debug!(message_id = %id, key = %key, "duplicate of a completed delivery");
                    ack_quietly(shared, id).await;
                } else {
                    // Another consumer holds the reservation; hand this copy
                    // back through the scheduler for whoever finishes it.
                    debug!(message_id = %id, key = %key, "delivery contested, rescheduling");
                    if let Err(e) =
                        schedule_on_zset(shared, fields.clone(), CONTESTED_RESCHEDULE_DELAY).await
                    {
                        warn!(message_id = %id, error = %e, "failed to reschedule contested delivery");
                    }
                    ack_quietly(shared, id).await;
                }
                return;
            }
            Err(e) => {
                warn!(message_id = %id, error = %e, "idempotency reservation failed, processing anyway");
            }
        }
    }

    let ctx = MessageContext {
        id: id.to_string(),
        headers: envelope.headers.clone(),
    };
    let (terminal, handler_error) =
        match shared.handler.handle(envelope.payload.clone(), ctx).await {
            Ok(Some(terminal)) => (terminal, None),
            Ok(None) => (Terminal::Ack, None),
            Err(e) => (shared.retry_policy.next(&envelope.headers, &e), Some(e)),
        };

    if let Err(e) = apply_terminal(
        shared,
        id,
        &envelope,
        &terminal,
        handler_error.as_ref(),
        reservation.as_deref(),
    )
    .await
    {
        // No entry may be redelivered forever by this worker alone: clear
        // the mark, log, and acknowledge.
        error!(message_id = %id, error = %e, "terminal action failed, acknowledging entry");
        clear_reservation(shared, reservation.as_deref()).await;
        ack_quietly(shared, id).await;
    }
}

async fn apply_terminal(
    shared: &Arc<WorkerShared>,
    id: &str,
    envelope: &Envelope,
    terminal: &Terminal,
    handler_error: Option<&HandlerError>,
    reservation: Option<&str>,
) -> Result<(), StreamError> {
    let config = &shared.config;
    match terminal {
        Terminal::Ack => {
            shared
                .client
                .xack(&config.stream, &config.group, &[id.to_string()])
                .await?;
            if let (Some(key), Some(kv), Some(idem)) =
                (reservation, shared.client.kv_ops(), &config.idempotency)
            {
                kv.set_ex(key, "DONE", idem.done_ttl_sec).await?;
            }
            info!(
                message_id = %id,
                kind = %envelope.headers.kind,
                attempt = envelope.headers.attempt,
                "message acknowledged"
            );
        }
        Terminal::Retry { delay } => {
            clear_reservation(shared, reservation).await;
            let next = Envelope::new(envelope.headers.next_attempt(), envelope.payload.clone());
            let next_fields = shared.codec.encode(&next)?;
            schedule_retry(shared, next_fields, *delay).await?;
            shared
                .client
                .xack(&config.stream, &config.group, &[id.to_string()])
                .await?;
            info!(
                message_id = %id,
                kind = %envelope.headers.kind,
                next_attempt = next.headers.attempt,
                delay_ms = delay.as_millis() as u64,
                "message scheduled for retry"
            );
        }
        Terminal::Dlq { reason } => {
            clear_reservation(shared, reservation).await;
            let error_meta = json!({
                "reason": reason,
                "meta": handler_error.map(|e| e.to_string()),
            });
            let handled_by = json!({
                "group": config.group,
                "consumer": config.consumer,
            });
            let dlq_fields: FieldMap = vec![
                (
                    "headers".to_string(),
                    serde_json::to_string(&envelope.headers)?,
                ),
                (
                    "payload".to_string(),
                    serde_json::to_string(&envelope.payload)?,
                ),
                ("error".to_string(), error_meta.to_string()),
                ("handledBy".to_string(), handled_by.to_string()),
            ];
            shared.client.xadd(&config.dlq_stream(), None, &dlq_fields).await?;
            shared
                .client
                .xack(&config.stream, &config.group, &[id.to_string()])
                .await?;
            warn!(
                message_id = %id,
                kind = %envelope.headers.kind,
                attempt = envelope.headers.attempt,
                reason = %reason,
                "message dead-lettered"
            );
        }
    }
    Ok(())
}

/// Route a retry terminal's fields back into the pipeline after `delay`:
/// onto the retry sorted set in zset mode, straight back to the stream
/// otherwise.
async fn schedule_retry(
    shared: &Arc<WorkerShared>,
    fields: FieldMap,
    delay: Duration,
) -> Result<(), StreamError> {
    if shared.config.scheduling.mode == SchedulingMode::Zset {
        return schedule_on_zset(shared, fields, delay).await;
    }
    shared.client.xadd(&shared.config.stream, None, &fields).await?;
    Ok(())
}

/// Put fields on the retry sorted set `delay` from now, regardless of the
/// scheduling mode. Contested deliveries always go through here so the
/// delay holds; an immediate re-append would bounce the entry straight
/// back. Falls back to a direct re-append only when the client has no
/// sorted sets.
async fn schedule_on_zset(
    shared: &Arc<WorkerShared>,
    fields: FieldMap,
    delay: Duration,
) -> Result<(), StreamError> {
    let config = &shared.config;
    if let Some(zset) = shared.client.sorted_set_ops() {
        let member = serde_json::to_string(&RetryMember {
            stream: Some(config.stream.clone()),
            fields,
        })?;
        let due = now_ms() + delay.as_millis() as i64;
        zset.zadd(&config.retry_zset(), &member, due).await?;
        return Ok(());
    }
    warn!("client lacks sorted sets; re-appending directly");
    shared.client.xadd(&config.stream, None, &fields).await?;
    Ok(())
}

async fn ack_quietly(shared: &Arc<WorkerShared>, id: &str) {
    let config = &shared.config;
    if let Err(e) = shared
        .client
        .xack(&config.stream, &config.group, &[id.to_string()])
        .await
    {
        error!(message_id = %id, error = %e, "failed to acknowledge entry");
    }
}

async fn clear_reservation(shared: &Arc<WorkerShared>, reservation: Option<&str>) {
    let (Some(key), Some(kv)) = (reservation, shared.client.kv_ops()) else {
        return;
    };
    if let Err(e) = kv.del(key).await {
        warn!(key = %key, error = %e, "failed to clear idempotency reservation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryStreamClient, StreamClient};
    use crate::config::{BatchConfig, ClaimConfig, RetryDaemonConfig, SchedulingConfig};
    use crate::daemon::RetryDaemon;
    use crate::producer::{Producer, SendOptions};
    use crate::retry::Backoff;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone)]
    enum Outcome {
        Ack,
        Explicit(Terminal),
        FailRetry(&'static str),
        FailFatal(&'static str),
    }

    /// Pops one scripted outcome per invocation; acks once the script runs dry.
    struct ScriptedHandler {
        calls: AtomicUsize,
        seen: StdMutex<Vec<MessageContext>>,
        script: StdMutex<VecDeque<Outcome>>,
        delay: Option<Duration>,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
                script: StdMutex::new(script.into()),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
                script: StdMutex::new(VecDeque::new()),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn attempts_seen(&self) -> Vec<u32> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|ctx| ctx.headers.attempt)
                .collect()
        }
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        async fn handle(
            &self,
            _payload: serde_json::Value,
            ctx: MessageContext,
        ) -> Result<Option<Terminal>, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(ctx);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = self.script.lock().unwrap().pop_front();
            match outcome {
                None | Some(Outcome::Ack) => Ok(None),
                Some(Outcome::Explicit(t)) => Ok(Some(t)),
                Some(Outcome::FailRetry(msg)) => Err(HandlerError::Retry(msg.to_string())),
                Some(Outcome::FailFatal(msg)) => Err(HandlerError::NonRetry(msg.to_string())),
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig::new("jobs", "workers")
            .with_consumer("w1")
            .with_batch(BatchConfig {
                count: 16,
                block_ms: 50,
            })
            .with_pel_claim(ClaimConfig {
                enabled: false,
                ..ClaimConfig::default()
            })
    }

    fn constant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Constant {
                delay: Duration::from_millis(5),
            },
        )
    }

    fn dlq_field<'a>(fields: &'a FieldMap, name: &str) -> serde_json::Value {
        let raw = &fields.iter().find(|(k, _)| k == name).unwrap().1;
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn happy_path_invokes_handler_once_and_acks() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer
            .send(json!({"value": "hello"}), SendOptions::default())
            .await
            .unwrap();

        assert!(wait_until(|| handler.calls() == 1, Duration::from_secs(2)).await);
        assert!(wait_until(|| client.pending_len("jobs", "workers") == 0, Duration::from_secs(2)).await);
        assert_eq!(client.entries("jobs:dlq").len(), 0);

        worker.stop(StopOptions::default()).await;
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn retry_twice_then_succeed_through_the_daemon() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![
            Outcome::FailRetry("first"),
            Outcome::FailRetry("second"),
            Outcome::Ack,
        ]);
        let policy = RetryPolicy::new(
            5,
            Backoff::ExponentialJitter {
                base: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
        );
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            policy,
        );
        worker.start().await.unwrap();

        let daemon = RetryDaemon::new(
            Arc::new(client.clone()),
            RetryDaemonConfig::new("jobs:retry", "jobs").with_tick_ms(10),
        );
        daemon.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!({"n": 1}), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| handler.calls() == 3, Duration::from_secs(5)).await);
        assert!(wait_until(|| client.pending_len("jobs", "workers") == 0, Duration::from_secs(2)).await);
        assert_eq!(client.entries("jobs:dlq").len(), 0);
        assert_eq!(handler.attempts_seen(), vec![0, 1, 2]);

        daemon.stop().await;
        worker.stop(StopOptions::default()).await;
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_land_in_the_dlq() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![
            Outcome::FailRetry("a"),
            Outcome::FailRetry("b"),
            Outcome::FailRetry("c"),
        ]);
        // Direct re-append: retries come back without a daemon.
        let config = fast_config().with_scheduling(SchedulingConfig {
            mode: SchedulingMode::None,
            retry_zset: None,
        });
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(2),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!({"n": 1}), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| client.entries("jobs:dlq").len() == 1, Duration::from_secs(5)).await);
        worker.stop(StopOptions::default()).await;

        assert_eq!(handler.calls(), 2);
        assert_eq!(handler.attempts_seen(), vec![0, 1]);

        let dlq = client.entries("jobs:dlq");
        let error = dlq_field(&dlq[0].1, "error");
        assert_eq!(error["reason"], "maxAttempts(2)");
        assert!(error["meta"].as_str().unwrap().contains("b"));
        let handled_by = dlq_field(&dlq[0].1, "handledBy");
        assert_eq!(handled_by["group"], "workers");
        assert_eq!(handled_by["consumer"], "w1");
        let headers = dlq_field(&dlq[0].1, "headers");
        assert_eq!(headers["attempt"], 1);
        assert_eq!(client.pending_len("jobs", "workers"), 0);
    }

    #[tokio::test]
    async fn attempts_increase_strictly_along_the_retry_chain() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![
            Outcome::FailRetry("x"),
            Outcome::FailRetry("x"),
            Outcome::FailRetry("x"),
            Outcome::FailRetry("x"),
        ]);
        let config = fast_config().with_scheduling(SchedulingConfig {
            mode: SchedulingMode::None,
            retry_zset: None,
        });
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(4),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| client.entries("jobs:dlq").len() == 1, Duration::from_secs(5)).await);
        worker.stop(StopOptions::default()).await;
        assert_eq!(handler.attempts_seen(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn non_retryable_errors_skip_retries() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![Outcome::FailFatal("bad input")]);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(10),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| client.entries("jobs:dlq").len() == 1, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;

        assert_eq!(handler.calls(), 1);
        let dlq = client.entries("jobs:dlq");
        assert_eq!(dlq_field(&dlq[0].1, "error")["reason"], "non-retryable");
    }

    #[tokio::test]
    async fn explicit_dlq_terminal_is_honored() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![Outcome::Explicit(Terminal::Dlq {
            reason: "manual".into(),
        })]);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| client.entries("jobs:dlq").len() == 1, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
        let dlq = client.entries("jobs:dlq");
        assert_eq!(dlq_field(&dlq[0].1, "error")["reason"], "manual");
    }

    #[tokio::test]
    async fn undecodable_entries_are_acked_not_dispatched() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        client
            .xadd("jobs", None, &vec![("garbage".to_string(), "x".to_string())])
            .await
            .unwrap();

        assert!(wait_until(
            || client.pending_len("jobs", "workers") == 0 && client.entries("jobs").len() == 1,
            Duration::from_secs(2)
        )
        .await);
        worker.stop(StopOptions::default()).await;
        assert_eq!(handler.calls(), 0);
        assert_eq!(client.entries("jobs:dlq").len(), 0);
    }

    #[tokio::test]
    async fn repeated_start_leaves_one_read_loop() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();
        worker.start().await.unwrap();

        assert_eq!(
            client.xgroup_names("jobs").await.unwrap(),
            vec!["workers".to_string()]
        );

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| handler.calls() >= 1, Duration::from_secs(2)).await);
        // Give a second loop time to double-process if one existed.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handler.calls(), 1);

        worker.stop(StopOptions::default()).await;
        worker.stop(StopOptions::default()).await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn worker_restarts_after_stop() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();
        worker.stop(StopOptions::default()).await;

        worker.start().await.unwrap();
        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();
        assert!(wait_until(|| handler.calls() == 1, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
    }

    #[tokio::test]
    async fn drain_waits_for_the_handler_to_finish() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::slow(Duration::from_millis(150));
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            fast_config(),
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();

        assert!(wait_until(|| handler.calls() == 1, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
        assert_eq!(worker.in_flight(), 0);
        assert_eq!(client.pending_len("jobs", "workers"), 0);
    }

    #[tokio::test]
    async fn completed_key_suppresses_duplicate_deliveries() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        let config = fast_config().with_idempotency(60, 3600);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        let opts = SendOptions::kind("email").with_key("user-1");
        producer.send(json!(1), opts.clone()).await.unwrap();
        producer.send(json!(1), opts).await.unwrap();

        assert!(wait_until(
            || client.pending_len("jobs", "workers") == 0 && client.entries("jobs").len() == 2,
            Duration::from_secs(2)
        )
        .await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop(StopOptions::default()).await;
        assert_eq!(handler.calls(), 1);
        assert_eq!(client.entries("jobs:dlq").len(), 0);
    }

    #[tokio::test]
    async fn contested_reservation_reschedules_a_copy() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        let config = fast_config().with_idempotency(60, 3600);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        // Someone else holds the reservation for this key.
        client
            .kv_ops()
            .unwrap()
            .set_ex("consumed:jobs:user-1", "PENDING:other-worker", 60)
            .await
            .unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer
            .send(json!(1), SendOptions::kind("email").with_key("user-1"))
            .await
            .unwrap();

        assert!(wait_until(|| client.zset_len("jobs:retry") == 1, Duration::from_secs(2)).await);
        assert!(wait_until(|| client.pending_len("jobs", "workers") == 0, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn contested_reschedule_uses_the_zset_even_in_direct_mode() {
        let client = MemoryStreamClient::new();
        let handler = ScriptedHandler::new(vec![]);
        // Direct re-append for retry terminals, but contested copies must
        // still take the delayed sorted-set route.
        let config = fast_config()
            .with_scheduling(SchedulingConfig {
                mode: SchedulingMode::None,
                retry_zset: None,
            })
            .with_idempotency(60, 3600);
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        client
            .kv_ops()
            .unwrap()
            .set_ex("consumed:jobs:user-1", "PENDING:other-worker", 60)
            .await
            .unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer
            .send(json!(1), SendOptions::kind("email").with_key("user-1"))
            .await
            .unwrap();

        assert!(wait_until(|| client.zset_len("jobs:retry") == 1, Duration::from_secs(2)).await);
        assert!(wait_until(|| client.pending_len("jobs", "workers") == 0, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
        // No immediate re-append: the original entry is the only one.
        assert_eq!(client.entries("jobs").len(), 1);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn claim_loop_recovers_deliveries_of_a_dead_consumer() {
        let client = MemoryStreamClient::new();
        client.xgroup_create("jobs", "workers").await.unwrap();

        // A consumer reads an entry and dies before acknowledging.
        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer
            .send(json!({"value": "orphan"}), SendOptions::default())
            .await
            .unwrap();
        let delivered = client
            .xread_group("jobs", "workers", "dead-worker", 16, 50)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(client.pending_len("jobs", "workers"), 1);

        let handler = ScriptedHandler::new(vec![]);
        let config = ConsumerConfig::new("jobs", "workers")
            .with_consumer("rescuer")
            .with_batch(BatchConfig {
                count: 16,
                block_ms: 50,
            })
            .with_pel_claim(ClaimConfig {
                enabled: true,
                min_idle_ms: 50,
                max_per_tick: 128,
                interval_ms: 40,
            });
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        assert!(wait_until(|| handler.calls() >= 1, Duration::from_secs(3)).await);
        assert!(wait_until(|| client.pending_len("jobs", "workers") == 0, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
        assert_eq!(client.entries("jobs:dlq").len(), 0);
    }

    #[tokio::test]
    async fn claim_disabled_when_client_lacks_pending_ops() {
        let client = MemoryStreamClient::new().without_pending();
        let handler = ScriptedHandler::new(vec![]);
        let config = ConsumerConfig::new("jobs", "workers")
            .with_consumer("w1")
            .with_batch(BatchConfig {
                count: 16,
                block_ms: 50,
            });
        let worker = ConsumerWorker::new(
            Arc::new(client.clone()),
            config,
            handler.clone(),
            constant_policy(5),
        );
        worker.start().await.unwrap();

        let producer = Producer::new(Arc::new(client.clone()), crate::ProducerConfig::new("jobs"));
        producer.send(json!(1), SendOptions::default()).await.unwrap();
        assert!(wait_until(|| handler.calls() == 1, Duration::from_secs(2)).await);
        worker.stop(StopOptions::default()).await;
    }
}
