//! Producer API: wrap data in an envelope and enqueue it.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backend::{MessageId, QueueBackend};
use crate::correlation::{CorrelationTracker, Transition};
use crate::envelope::{Envelope, Version};
use crate::error::{Error, Result};

/// Optional metadata for a new message.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub correlation_id: Option<String>,
    pub target_id: Option<String>,
    pub version: Option<Version>,
    /// Keep the message invisible for this long.
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn version(mut self, version: impl Into<Version>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub struct Producer {
    backend: Arc<dyn QueueBackend>,
    tracker: Option<CorrelationTracker>,
}

impl Producer {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            tracker: None,
        }
    }

    /// Record correlation ids of produced messages.
    pub fn with_tracker(mut self, tracker: CorrelationTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Enqueue `data` for the handler of `queue_name`.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<MessageId> {
        let mut envelope = Envelope::try_new(queue_name, data)?;
        envelope.meta.correlation_id = options.correlation_id;
        envelope.meta.target_id = options.target_id;
        envelope.meta.version = options.version;

        if let (Some(tracker), Some(id)) = (&self.tracker, &envelope.meta.correlation_id) {
            tracker.touch(id).await?;
        }

        let message_id = self
            .backend
            .enqueue(queue_name, &envelope, options.delay)
            .await?;
        debug!(
            queue = queue_name,
            message_id,
            correlation_id = ?envelope.meta.correlation_id,
            "enqueued"
        );
        Ok(message_id)
    }

    /// Declare the fan-out size of `correlation_id`.
    pub async fn expect(&self, correlation_id: &str, expected_count: u32) -> Result<Transition> {
        let tracker = self
            .tracker
            .as_ref()
            .ok_or_else(|| Error::Config("producer has no correlation tracker".into()))?;
        tracker.note_expected(correlation_id, expected_count).await
    }
}
