//! Consumer-side pipeline: handler contract and the worker that drives it.

pub mod consumer;
pub mod handler;

pub use consumer::{ConsumerWorker, StopOptions};
pub use handler::{Handler, HandlerFn, MessageContext};
