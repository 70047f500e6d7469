//! Handler contract for consumed messages.

use async_trait::async_trait;

use crate::envelope::Headers;
use crate::retry::{HandlerError, Terminal};

/// Delivery metadata passed alongside the payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Stream entry id of this delivery.
    pub id: String,
    pub headers: Headers,
}

/// Processes one message and decides its terminal.
///
/// Returning `Ok(None)` acknowledges. Returning an explicit [`Terminal`]
/// overrides the retry policy. Errors are routed through the policy to
/// retry or the DLQ.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        payload: serde_json::Value,
        ctx: MessageContext,
    ) -> Result<Option<Terminal>, HandlerError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(serde_json::Value, MessageContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<Terminal>, HandlerError>> + Send,
{
    async fn handle(
        &self,
        payload: serde_json::Value,
        ctx: MessageContext,
    ) -> Result<Option<Terminal>, HandlerError> {
        (self.0)(payload, ctx).await
    }
}
