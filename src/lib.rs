//! StreamQ: a typed, at-least-once job runner on Valkey/Redis streams
//!
//! This crate provides a delivery pipeline built on stream and sorted-set
//! primitives with support for:
//! - **Typed envelopes** carrying a message kind, attempt counter and
//!   optional idempotency/trace headers
//! - **Consumer groups** distributing deliveries across worker instances
//! - **Retry scheduling** through a sorted-set time wheel drained by a
//!   retry daemon at due time
//! - **Dead letter stream** for messages that exhaust their attempts or
//!   fail unrecoverably
//! - **Crash recovery** reclaiming deliveries left pending by dead
//!   consumers
//! - **Producer and handler idempotency** backed by server-atomic
//!   reservations
//! - **Graceful shutdown** draining in-flight work
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use streamq::{
//!     connect, Backoff, ConsumerConfig, ConsumerWorker, Handler, HandlerError,
//!     MessageContext, Producer, ProducerConfig, RetryDaemon, RetryDaemonConfig,
//!     RetryPolicy, SendOptions, StopOptions, Terminal,
//! };
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Handler for SendEmail {
//!     async fn handle(
//!         &self,
//!         payload: serde_json::Value,
//!         _ctx: MessageContext,
//!     ) -> Result<Option<Terminal>, HandlerError> {
//!         let to = payload["to"]
//!             .as_str()
//!             .ok_or_else(|| HandlerError::NonRetry("missing 'to'".into()))?;
//!         println!("sending email to {to}");
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(connect("redis://127.0.0.1:6379").await?);
//!
//!     // Producer side.
//!     let producer = Producer::new(
//!         client.clone(),
//!         ProducerConfig::new("emails").with_idempotency(60),
//!     );
//!     producer
//!         .send(
//!             serde_json::json!({"to": "user@example.com"}),
//!             SendOptions::kind("email.send").with_key("user-1"),
//!         )
//!         .await?;
//!
//!     // Consumer side.
//!     let handler = Arc::new(SendEmail);
//!     let policy = RetryPolicy::new(
//!         5,
//!         Backoff::ExponentialJitter {
//!             base: Duration::from_millis(250),
//!             max: Duration::from_secs(60),
//!         },
//!     );
//!     let worker = ConsumerWorker::new(
//!         client.clone(),
//!         ConsumerConfig::new("emails", "email-workers"),
//!         handler,
//!         policy,
//!     );
//!     worker.start().await?;
//!
//!     // Retry daemon re-injects scheduled retries at their due time.
//!     let daemon = RetryDaemon::new(
//!         client.clone(),
//!         RetryDaemonConfig::new("emails:retry", "emails"),
//!     );
//!     daemon.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     daemon.stop().await;
//!     worker.stop(StopOptions::default()).await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod consumer;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod producer;
pub mod retry;
pub mod sweeper;

pub use crate::client::{
    connect, connect_with, AtomicOps, KvOps, MemoryStreamClient, PendingInfo, PendingOps,
    RedisPoolConfig, RedisStreamClient, SortedSetOps, StreamClient,
};
pub use crate::config::{
    BatchConfig, ClaimConfig, ConsumerConfig, ConsumerIdempotency, ProducerConfig,
    ProducerIdempotency, RetryDaemonConfig, SchedulingConfig, SchedulingMode, SweeperConfig,
};
pub use crate::consumer::{ConsumerWorker, Handler, HandlerFn, MessageContext, StopOptions};
pub use crate::daemon::{RetryDaemon, RetryMember};
pub use crate::envelope::{Envelope, EnvelopeCodec, FieldMap, Headers, JsonFieldCodec};
pub use crate::error::StreamError;
pub use crate::producer::{Producer, SendOptions};
pub use crate::retry::{Backoff, HandlerError, RetryPolicy, Terminal};
pub use crate::sweeper::PendingSweeper;
