//! In-memory correlation store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::CorrelationStore;
use super::record::{CorrelationRecord, Transition};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    records: HashMap<String, CorrelationRecord>,
    /// `(correlation_id, outcome_key)` pairs already counted.
    counted: HashSet<(String, String)>,
}

/// Records behind one mutex: every update is serialized.
#[derive(Default)]
pub struct InMemoryCorrelationStore {
    inner: Mutex<Inner>,
}

impl InMemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn touch(&self, correlation_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(correlation_id) {
            return Ok(false);
        }
        inner.records.insert(
            correlation_id.to_string(),
            CorrelationRecord::new(correlation_id),
        );
        Ok(true)
    }

    async fn note_expected(
        &self,
        correlation_id: &str,
        expected_count: u32,
    ) -> Result<(Transition, CorrelationRecord)> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .entry(correlation_id.to_string())
            .or_insert_with(|| CorrelationRecord::new(correlation_id));
        let transition = record.apply_expected(expected_count);
        Ok((transition, record.clone()))
    }

    async fn note_outcome(
        &self,
        correlation_id: &str,
        outcome_key: Option<&str>,
        succeeded: bool,
        fail_fast: bool,
    ) -> Result<(Transition, CorrelationRecord)> {
        let mut guard = self.inner.lock().await;
        let Inner { records, counted } = &mut *guard;
        let record = records
            .entry(correlation_id.to_string())
            .or_insert_with(|| CorrelationRecord::new(correlation_id));
        let first_time = outcome_key
            .is_none_or(|key| counted.insert((correlation_id.to_string(), key.to_string())));
        if !first_time {
            return Ok((Transition::Duplicate, record.clone()));
        }
        let transition = record.apply_outcome(succeeded, fail_fast);
        Ok((transition, record.clone()))
    }

    async fn get(&self, correlation_id: &str) -> Result<Option<CorrelationRecord>> {
        Ok(self.inner.lock().await.records.get(correlation_id).cloned())
    }
}
