//! Handler contract.
//!
//! A handler processes envelopes from exactly one queue. It reports one of
//! three outcomes: success, a retryable failure, or a fatal failure that
//! must go straight to the dead-letter queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, Version};

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient condition (timeout, lock contention). Governed by the retry policy.
    Retryable,
    /// The message can never succeed. Dead-lettered regardless of attempt count.
    Fatal,
}

/// A failed handler attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HandlerError {
    pub kind: FailureKind,
    pub message: String,
    /// Diagnostic trace stored in `meta.stack_trace`.
    pub trace: Option<String>,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            trace: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FailureKind::Fatal
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::retryable(err.to_string()).with_trace(format!("{err:?}"))
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Per-attempt execution context.
///
/// Deadlines are cooperative: a handler that ignores `cancelled()` keeps
/// running, but its lease is resolved as a retry anyway.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub queue: String,
    pub message_id: i64,
    pub deadline: Instant,
    cancel: CancellationToken,
}

impl HandlerContext {
    pub fn new(
        queue: impl Into<String>,
        message_id: i64,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: queue.into(),
            message_id,
            deadline,
            cancel,
        }
    }

    /// Resolves once the attempt's deadline passed or shutdown forced release.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Check the message before handling. A failure here is fatal.
    async fn validate(&self, _envelope: &Envelope) -> HandlerResult {
        Ok(())
    }

    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> HandlerResult;
}

// ---------------------------------------------------------------------------
// Version routing
// ---------------------------------------------------------------------------

/// Routes on `meta.version` so payload shapes can evolve under one queue.
#[derive(Default)]
pub struct VersionRouter {
    routes: HashMap<Version, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl VersionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, version: impl Into<Version>, handler: Arc<dyn Handler>) -> Self {
        self.routes.insert(version.into(), handler);
        self
    }

    /// Handler for messages whose version has no explicit route (or no version at all).
    pub fn fallback(mut self, handler: Arc<dyn Handler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    fn select(&self, envelope: &Envelope) -> Result<&Arc<dyn Handler>, HandlerError> {
        envelope
            .meta
            .version
            .as_ref()
            .and_then(|v| self.routes.get(v))
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                let version = envelope
                    .meta
                    .version
                    .as_ref()
                    .map_or_else(|| "none".to_string(), ToString::to_string);
                HandlerError::fatal(format!("unsupported version: {version}"))
            })
    }
}

#[async_trait]
impl Handler for VersionRouter {
    async fn validate(&self, envelope: &Envelope) -> HandlerResult {
        self.select(envelope)?.validate(envelope).await
    }

    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> HandlerResult {
        self.select(envelope)?.handle(envelope, ctx).await
    }
}
