//! Envelope model and the codec that maps it onto flat stream fields.
//!
//! Every stream entry carries a flat string field map. The codec owns the
//! layout of that map; producers and consumers only ever see [`Envelope`].

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Flat field map of a stream entry, in XADD argument order.
pub type FieldMap = Vec<(String, String)>;

/// Field holding the serialized headers in the default layout.
pub const HEADERS_FIELD: &str = "headers";
/// Field holding the serialized payload in the default layout.
pub const PAYLOAD_FIELD: &str = "payload";

/// Current epoch time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message headers. Wire names follow the envelope contract
/// (`type`, `attempt`, `enqueuedAt`, `key`, `traceId`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    #[serde(rename = "type")]
    pub kind: String,
    pub attempt: u32,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Headers {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attempt: 0,
            enqueued_at: now_ms(),
            key: None,
            trace_id: None,
        }
    }

    /// Headers for a retry re-enqueue: attempt bumped, enqueue time refreshed,
    /// everything else (including the trace id) carried unchanged.
    pub fn next_attempt(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            attempt: self.attempt + 1,
            enqueued_at: now_ms(),
            key: self.key.clone(),
            trace_id: self.trace_id.clone(),
        }
    }
}

/// The `{headers, payload}` unit exchanged between producer and consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: Headers,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(headers: Headers, payload: serde_json::Value) -> Self {
        Self { headers, payload }
    }
}

/// Maps envelopes to and from flat stream fields.
///
/// `decode` must round-trip any output of `encode`. Implementations are pure
/// and perform no I/O.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<FieldMap, StreamError>;
    fn decode(&self, fields: &FieldMap) -> Result<Envelope, StreamError>;
}

/// Default layout: headers and payload serialized as independent JSON strings
/// under the `headers` and `payload` fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFieldCodec;

impl EnvelopeCodec for JsonFieldCodec {
    fn encode(&self, envelope: &Envelope) -> Result<FieldMap, StreamError> {
        Ok(vec![
            (
                HEADERS_FIELD.to_string(),
                serde_json::to_string(&envelope.headers)?,
            ),
            (
                PAYLOAD_FIELD.to_string(),
                serde_json::to_string(&envelope.payload)?,
            ),
        ])
    }

    fn decode(&self, fields: &FieldMap) -> Result<Envelope, StreamError> {
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| StreamError::Codec(format!("missing '{name}' field")))
        };

        let headers: Headers = serde_json::from_str(lookup(HEADERS_FIELD)?)
            .map_err(|e| StreamError::Codec(format!("bad headers: {e}")))?;
        let payload: serde_json::Value = serde_json::from_str(lookup(PAYLOAD_FIELD)?)
            .map_err(|e| StreamError::Codec(format!("bad payload: {e}")))?;

        Ok(Envelope { headers, payload })
    }
}
