//! Correlation tracking: has this unit of work, and everything it fanned
//! out into, finished?
//!
//! Records are mutated only through a [`CorrelationStore`], which applies
//! each change under a single point of serialization (a mutex for the
//! in-memory store, a row lock inside a transaction for Postgres).

pub mod memory;
pub mod record;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{EventBus, EventKind};

pub use memory::InMemoryCorrelationStore;
pub use record::{CorrelationRecord, CorrelationState, CorrelationStatus, Transition};

/// Storage for correlation records.
///
/// Each method is one atomic read-modify-write. Implementations must never
/// let two callers interleave on the same correlation id.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Create an OPEN record if none exists. Returns true when created.
    async fn touch(&self, correlation_id: &str) -> Result<bool>;

    async fn note_expected(
        &self,
        correlation_id: &str,
        expected_count: u32,
    ) -> Result<(Transition, CorrelationRecord)>;

    /// Count one terminal outcome. With an `outcome_key`, a second outcome
    /// under the same key is reported as [`Transition::Duplicate`].
    async fn note_outcome(
        &self,
        correlation_id: &str,
        outcome_key: Option<&str>,
        succeeded: bool,
        fail_fast: bool,
    ) -> Result<(Transition, CorrelationRecord)>;

    async fn get(&self, correlation_id: &str) -> Result<Option<CorrelationRecord>>;
}

/// Tracker options.
#[derive(Debug, Clone, Default)]
pub struct CorrelationConfig {
    /// A single dead-lettered message fails the whole fan-out.
    pub fail_fast: bool,
}

/// Front door for correlation updates; emits transition events.
#[derive(Clone)]
pub struct CorrelationTracker {
    store: Arc<dyn CorrelationStore>,
    config: CorrelationConfig,
    events: Option<Arc<EventBus>>,
}

impl CorrelationTracker {
    pub fn new(store: Arc<dyn CorrelationStore>, config: CorrelationConfig) -> Self {
        Self {
            store,
            config,
            events: None,
        }
    }

    /// Tracker over a fresh in-memory store.
    pub fn in_memory(config: CorrelationConfig) -> Self {
        Self::new(Arc::new(InMemoryCorrelationStore::new()), config)
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn touch(&self, correlation_id: &str) -> Result<()> {
        self.store.touch(correlation_id).await?;
        Ok(())
    }

    /// Producer side: the fan-out size is known up front.
    pub async fn note_expected(&self, correlation_id: &str, expected_count: u32) -> Result<Transition> {
        let (transition, record) = self
            .store
            .note_expected(correlation_id, expected_count)
            .await?;
        if transition == Transition::Ignored {
            warn!(
                correlation_id,
                expected_count,
                state = %record.state,
                "expected count ignored on terminal correlation"
            );
        }
        self.publish(transition, &record);
        Ok(transition)
    }

    /// Terminal resolution (ack or dead-letter) of one message.
    pub async fn note_outcome(&self, correlation_id: &str, succeeded: bool) -> Result<Transition> {
        self.outcome(correlation_id, None, succeeded).await
    }

    /// Like [`note_outcome`](Self::note_outcome), counted at most once per
    /// `outcome_key`, so a retried update cannot count the same message twice.
    pub async fn note_message_outcome(
        &self,
        correlation_id: &str,
        outcome_key: &str,
        succeeded: bool,
    ) -> Result<Transition> {
        self.outcome(correlation_id, Some(outcome_key), succeeded)
            .await
    }

    async fn outcome(
        &self,
        correlation_id: &str,
        outcome_key: Option<&str>,
        succeeded: bool,
    ) -> Result<Transition> {
        let (transition, record) = self
            .store
            .note_outcome(correlation_id, outcome_key, succeeded, self.config.fail_fast)
            .await?;
        match transition {
            Transition::Ignored => warn!(
                correlation_id,
                succeeded,
                state = %record.state,
                resolved = record.resolved_count(),
                expected = ?record.expected_count,
                "outcome ignored: correlation already resolved"
            ),
            Transition::Duplicate => {
                debug!(correlation_id, ?outcome_key, "outcome already counted")
            }
            Transition::Counted | Transition::Changed { .. } => {}
        }
        self.publish(transition, &record);
        Ok(transition)
    }

    pub async fn status(&self, correlation_id: &str) -> Result<CorrelationStatus> {
        Ok(self
            .store
            .get(correlation_id)
            .await?
            .map_or(CorrelationStatus::Unknown, |r| r.state.into()))
    }

    pub async fn record(&self, correlation_id: &str) -> Result<Option<CorrelationRecord>> {
        self.store.get(correlation_id).await
    }

    fn publish(&self, transition: Transition, record: &CorrelationRecord) {
        let (Transition::Changed { from, to }, Some(events)) = (transition, &self.events) else {
            return;
        };
        events.emit(EventKind::CorrelationTransition {
            correlation_id: record.correlation_id.clone(),
            from,
            to,
            completed_count: record.completed_count,
            failed_count: record.failed_count,
        });
    }
}
