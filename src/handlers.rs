//! Built-in handlers for smoke-testing a deployment end to end.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::handler::{Handler, HandlerContext, HandlerError, HandlerResult};
use crate::registry::HandlerRegistry;

/// Queue served by [`NoopHandler`].
pub const MB_TEST: &str = "mb_test";
/// Queue served by [`FailingHandler`].
pub const EXCEPTION_TEST: &str = "exception_test";

/// Logs the message and succeeds.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> HandlerResult {
        info!(
            queue = %ctx.queue,
            message_id = ctx.message_id,
            attempt = envelope.meta.attempt,
            data = %envelope.data,
            "mb_test handled"
        );
        Ok(())
    }
}

/// Passes validation, then always fails retryably.
pub struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    async fn handle(&self, envelope: &Envelope, _ctx: &HandlerContext) -> HandlerResult {
        Err(HandlerError::retryable(format!(
            "exception_test failure on attempt {}",
            envelope.meta.attempt
        ))
        .with_trace("handlers::FailingHandler::handle"))
    }
}

/// Register the built-in handlers.
pub fn register_builtin(registry: &mut HandlerRegistry) -> Result<()> {
    registry.register(MB_TEST, Arc::new(NoopHandler))?;
    registry.register(EXCEPTION_TEST, Arc::new(FailingHandler))?;
    Ok(())
}
