//! Postgres correlation store.
//!
//! Each update runs in one transaction holding the row lock
//! (`SELECT ... FOR UPDATE`), so concurrent workers resolving messages
//! of the same fan-out are serialized by Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::correlation::{CorrelationRecord, CorrelationState, CorrelationStore, Transition};
use crate::error::{Error, Result};

pub struct PgCorrelationStore {
    pool: PgPool,
}

impl PgCorrelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `mutate` to the locked record for `correlation_id`, creating it if absent.
    ///
    /// With an `outcome_key`, the key is recorded in the same transaction and
    /// an already-recorded key leaves the record untouched.
    async fn update<F>(
        &self,
        correlation_id: &str,
        outcome_key: Option<&str>,
        mutate: F,
    ) -> Result<(Transition, CorrelationRecord)>
    where
        F: FnOnce(&mut CorrelationRecord) -> Transition + Send,
    {
        let mut tx = self.pool.begin().await?;
        insert_if_absent(&mut tx, correlation_id).await?;

        let row: CorrelationRow = sqlx::query_as(
            "SELECT correlation_id, expected_count, completed_count, failed_count, state, created_at, updated_at
             FROM msgbus_correlation WHERE correlation_id = $1 FOR UPDATE",
        )
        .bind(correlation_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut record = row.try_into_record()?;
        if let Some(key) = outcome_key {
            if !claim_outcome_key(&mut tx, correlation_id, key).await? {
                tx.rollback().await?;
                return Ok((Transition::Duplicate, record));
            }
        }
        let transition = mutate(&mut record);

        if transition.is_counted() {
            sqlx::query(
                "UPDATE msgbus_correlation
                 SET expected_count = $1, completed_count = $2, failed_count = $3, state = $4, updated_at = $5
                 WHERE correlation_id = $6",
            )
            .bind(record.expected_count.map(|n| n as i32))
            .bind(record.completed_count as i32)
            .bind(record.failed_count as i32)
            .bind(record.state.as_str())
            .bind(record.updated_at)
            .bind(correlation_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((transition, record))
    }
}

async fn insert_if_absent(tx: &mut Transaction<'_, Postgres>, correlation_id: &str) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT INTO msgbus_correlation (correlation_id) VALUES ($1)
         ON CONFLICT (correlation_id) DO NOTHING",
    )
    .bind(correlation_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

async fn claim_outcome_key(
    tx: &mut Transaction<'_, Postgres>,
    correlation_id: &str,
    outcome_key: &str,
) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT INTO msgbus_correlation_outcome (correlation_id, outcome_key) VALUES ($1, $2)
         ON CONFLICT DO NOTHING",
    )
    .bind(correlation_id)
    .bind(outcome_key)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

#[async_trait]
impl CorrelationStore for PgCorrelationStore {
    async fn touch(&self, correlation_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let created = insert_if_absent(&mut tx, correlation_id).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn note_expected(
        &self,
        correlation_id: &str,
        expected_count: u32,
    ) -> Result<(Transition, CorrelationRecord)> {
        self.update(correlation_id, None, |r| r.apply_expected(expected_count))
            .await
    }

    async fn note_outcome(
        &self,
        correlation_id: &str,
        outcome_key: Option<&str>,
        succeeded: bool,
        fail_fast: bool,
    ) -> Result<(Transition, CorrelationRecord)> {
        self.update(correlation_id, outcome_key, |r| {
            r.apply_outcome(succeeded, fail_fast)
        })
        .await
    }

    async fn get(&self, correlation_id: &str) -> Result<Option<CorrelationRecord>> {
        let row: Option<CorrelationRow> = sqlx::query_as(
            "SELECT correlation_id, expected_count, completed_count, failed_count, state, created_at, updated_at
             FROM msgbus_correlation WHERE correlation_id = $1",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CorrelationRow::try_into_record).transpose()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CorrelationRow {
    correlation_id: String,
    expected_count: Option<i32>,
    completed_count: i32,
    failed_count: i32,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CorrelationRow {
    fn try_into_record(self) -> Result<CorrelationRecord> {
        let state = CorrelationState::parse(&self.state).ok_or_else(|| {
            Error::Other(format!(
                "correlation {} has unknown state {:?}",
                self.correlation_id, self.state
            ))
        })?;
        Ok(CorrelationRecord {
            correlation_id: self.correlation_id,
            expected_count: self.expected_count.map(|n| n.max(0) as u32),
            completed_count: self.completed_count.max(0) as u32,
            failed_count: self.failed_count.max(0) as u32,
            state,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
