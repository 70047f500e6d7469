//! Producer: serialize an envelope and append it to the target stream.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::StreamClient;
use crate::config::{producer_idempotency_key, ProducerConfig};
use crate::envelope::{Envelope, EnvelopeCodec, Headers, JsonFieldCodec};
use crate::error::StreamError;

/// Per-send options.
#[derive(Debug, Default, Clone)]
pub struct SendOptions {
    /// Message kind; falls back to the producer's default, then `"msg"`.
    pub kind: Option<String>,
    /// Idempotency key enabling at-most-one enqueue per
    /// `(stream, type, key)` within the configured TTL window.
    pub key: Option<String>,
    /// Propagated unchanged through the whole delivery chain.
    pub trace_id: Option<String>,
}

impl SendOptions {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Appends typed envelopes to a stream, optionally de-duplicating through
/// the server-atomic reserve-and-append capability.
#[derive(Clone)]
pub struct Producer {
    client: Arc<dyn StreamClient>,
    codec: Arc<dyn EnvelopeCodec>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(client: Arc<dyn StreamClient>, config: ProducerConfig) -> Self {
        Self {
            client,
            codec: Arc::new(JsonFieldCodec),
            config,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    /// Enqueue a payload. Returns the entry id, or the value already stored
    /// for the idempotency key when an earlier send within the TTL window
    /// won the reservation (`"PENDING"` while that send is in flight).
    pub async fn send(
        &self,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> Result<Option<String>, StreamError> {
        let kind = opts
            .kind
            .or_else(|| self.config.default_kind.clone())
            .unwrap_or_else(|| "msg".to_string());
        let mut headers = Headers::new(kind);
        headers.key = opts.key;
        headers.trace_id = opts.trace_id;

        let envelope = Envelope::new(headers, payload);
        let fields = self.codec.encode(&envelope)?;

        if let (Some(idempotency), Some(key)) =
            (&self.config.idempotency, &envelope.headers.key)
        {
            if let Some(atomic) = self.client.atomic_ops() {
                let idem_key =
                    producer_idempotency_key(&self.config.stream, &envelope.headers.kind, key);
                let stored = atomic
                    .reserve_and_append(&idem_key, idempotency.ttl_sec, &self.config.stream, &fields)
                    .await?;
                debug!(
                    stream = %self.config.stream,
                    kind = %envelope.headers.kind,
                    key = %key,
                    stored = stored.as_deref().unwrap_or(""),
                    "idempotent send"
                );
                return Ok(stored);
            }
            warn!(
                stream = %self.config.stream,
                "idempotency configured but client lacks atomic ops; appending without de-duplication"
            );
        }

        let id = self
            .client
            .xadd(&self.config.stream, self.config.max_len, &fields)
            .await?;
        debug!(stream = %self.config.stream, message_id = %id, "message enqueued");
        Ok(Some(id))
    }

    /// Append several payloads with the same options. De-duplication does
    /// not apply to batches; the `key` option is ignored here.
    pub async fn send_batch(
        &self,
        payloads: Vec<serde_json::Value>,
        opts: SendOptions,
    ) -> Result<Vec<String>, StreamError> {
        let kind = opts
            .kind
            .or_else(|| self.config.default_kind.clone())
            .unwrap_or_else(|| "msg".to_string());

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let mut headers = Headers::new(kind.clone());
            headers.trace_id = opts.trace_id.clone();
            let fields = self.codec.encode(&Envelope::new(headers, payload))?;
            let id = self
                .client
                .xadd(&self.config.stream, self.config.max_len, &fields)
                .await?;
            ids.push(id);
        }
        debug!(stream = %self.config.stream, count = ids.len(), "batch enqueued");
        Ok(ids)
    }

    /// Current length of the target stream.
    pub async fn stream_len(&self) -> Result<u64, StreamError> {
        self.client.xlen(&self.config.stream).await
    }
}
