use redis::RedisError;
use thiserror::Error;

/// Errors surfaced by producers, consumers and daemons.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("envelope codec error: {0}")]
    Codec(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("client does not support {0}")]
    CapabilityMissing(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<RedisError> for StreamError {
    fn from(err: RedisError) -> Self {
        StreamError::Redis(err.to_string())
    }
}

impl StreamError {
    /// Transport-level failures that a loop should log and ride out.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Redis(_) | StreamError::Connection(_))
    }
}
