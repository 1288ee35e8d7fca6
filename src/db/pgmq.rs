//! pgmq queue adapter via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.send, pgmq.read, pgmq.archive,
//! pgmq.delete, pgmq.set_vt, plus the queue lifecycle functions.
//!
//! pgmq has no lease tokens. The token handed out is the visibility
//! timestamp from `read` (or `set_vt`). Every resolution first locks the
//! message row in `pgmq.q_<queue>` and compares its `vt` with the token, so
//! a lease that expired and was re-read elsewhere resolves nothing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::KeyValue;
use sqlx::{PgConnection, Postgres, Transaction};
use tokio::time::Instant;
use tracing::debug;

use super::Db;
use crate::backend::{
    DeadLetter, Lease, LeasedMessage, MessageId, QueueAdmin, QueueBackend, QueueMetrics,
};
use crate::config::{AckMode, QueueOptions};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub message: serde_json::Value,
}

fn record_op(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

fn token_for(vt: DateTime<Utc>) -> String {
    vt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Table pgmq keeps a queue's live messages in.
fn queue_table(queue: &str) -> Result<String> {
    if queue.is_empty() || !queue.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!("invalid queue name {queue:?}")));
    }
    Ok(format!("pgmq.q_{}", queue.to_lowercase()))
}

/// Lock the message row and check `lease` still holds it.
async fn lock_current(conn: &mut PgConnection, lease: &Lease) -> Result<bool> {
    let sql = format!(
        "SELECT vt FROM {} WHERE msg_id = $1 FOR UPDATE",
        queue_table(&lease.queue)?
    );
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(&sql)
        .bind(lease.message_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.is_some_and(|(vt,)| token_for(vt) == lease.token))
}

/// Open a transaction holding the message row, or `None` for a stale lease.
async fn begin_resolution(
    db: &Db,
    lease: &Lease,
    operation: &str,
) -> Result<Option<Transaction<'static, Postgres>>> {
    let mut tx = db.pool().begin().await?;
    if lock_current(&mut tx, lease).await? {
        return Ok(Some(tx));
    }
    tx.rollback().await?;
    debug!(queue = %lease.queue, message_id = lease.message_id, operation, "stale lease ignored");
    Ok(None)
}

/// pgmq takes whole seconds. Round up so a short lease never becomes zero.
fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
    i32::try_from(secs).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueBackend for Db {
    async fn enqueue(
        &self,
        queue: &str,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<MessageId> {
        envelope.check()?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(envelope.to_value())
            .bind(whole_seconds(delay))
            .fetch_one(self.pool())
            .await?;
        record_op(queue, "send");
        Ok(row.0)
    }

    async fn lease(
        &self,
        queue: &str,
        max: usize,
        lease_duration: Duration,
    ) -> Result<Vec<LeasedMessage>> {
        let started = Instant::now();
        let rows: Vec<PgmqMessage> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue)
        .bind(whole_seconds(lease_duration))
        .bind(i32::try_from(max).unwrap_or(i32::MAX))
        .fetch_all(self.pool())
        .await?;

        record_op(queue, if rows.is_empty() { "read_empty" } else { "read" });

        Ok(rows
            .into_iter()
            .map(|m| LeasedMessage {
                lease: Lease {
                    queue: queue.to_string(),
                    message_id: m.msg_id,
                    token: token_for(m.vt),
                    visible_at: m.vt,
                    deadline: started + lease_duration,
                    read_count: m.read_ct,
                },
                body: m.message,
            })
            .collect())
    }

    async fn ack(&self, lease: &Lease) -> Result<bool> {
        let (sql, operation) = match self.config().ack_mode {
            AckMode::Archive => ("SELECT pgmq.archive($1, $2::bigint)", "archive"),
            AckMode::Delete => ("SELECT pgmq.delete($1, $2::bigint)", "delete"),
        };
        let Some(mut tx) = begin_resolution(self, lease, operation).await? else {
            return Ok(false);
        };
        let (resolved,): (bool,) = sqlx::query_as(sql)
            .bind(&lease.queue)
            .bind(lease.message_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        record_op(&lease.queue, operation);
        Ok(resolved)
    }

    /// Re-send the annotated envelope and delete the original in one
    /// transaction.
    async fn nack(&self, lease: &Lease, envelope: &Envelope, delay: Duration) -> Result<bool> {
        let Some(mut tx) = begin_resolution(self, lease, "nack").await? else {
            return Ok(false);
        };

        sqlx::query("SELECT pgmq.delete($1, $2::bigint)")
            .bind(&lease.queue)
            .bind(lease.message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(&lease.queue)
            .bind(envelope.to_value())
            .bind(whole_seconds(delay))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record_op(&lease.queue, "nack");
        Ok(true)
    }

    async fn dead_letter(&self, lease: &Lease, record: &DeadLetter) -> Result<bool> {
        let dlq = self.config().dead_letter_queue(&lease.queue);
        let body = serde_json::to_value(record).map_err(|e| Error::Other(e.to_string()))?;
        let Some(mut tx) = begin_resolution(self, lease, "dead_letter").await? else {
            return Ok(false);
        };

        sqlx::query("SELECT pgmq.archive($1, $2::bigint)")
            .bind(&lease.queue)
            .bind(lease.message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&dlq)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pgmq.send($1, $2, 0)")
            .bind(&dlq)
            .bind(&body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record_op(&lease.queue, "dead_letter");
        Ok(true)
    }

    async fn extend_lease(&self, lease: &Lease, duration: Duration) -> Result<Option<Lease>> {
        let started = Instant::now();
        let Some(mut tx) = begin_resolution(self, lease, "set_vt").await? else {
            return Ok(None);
        };
        let (vt,): (DateTime<Utc>,) =
            sqlx::query_as("SELECT vt FROM pgmq.set_vt($1, $2::bigint, $3)")
                .bind(&lease.queue)
                .bind(lease.message_id)
                .bind(whole_seconds(duration))
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        record_op(&lease.queue, "set_vt");
        Ok(Some(Lease {
            token: token_for(vt),
            visible_at: vt,
            deadline: started + duration,
            ..lease.clone()
        }))
    }
}

#[async_trait]
impl QueueAdmin for Db {
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        match &options.partition {
            Some(p) => {
                sqlx::query("SELECT pgmq.create_partitioned($1, $2, $3)")
                    .bind(queue)
                    .bind(p.partition_interval.to_string())
                    .bind(p.retention_interval.to_string())
                    .execute(self.pool())
                    .await?;
            }
            None => {
                sqlx::query("SELECT pgmq.create($1)")
                    .bind(queue)
                    .execute(self.pool())
                    .await?;
            }
        }
        record_op(queue, "create");
        Ok(())
    }

    async fn drop_queue(&self, queue: &str) -> Result<bool> {
        if !self.list_queues().await?.iter().any(|q| q == queue) {
            return Ok(false);
        }
        let (dropped,): (bool,) = sqlx::query_as("SELECT pgmq.drop_queue($1)")
            .bind(queue)
            .fetch_one(self.pool())
            .await?;
        record_op(queue, "drop");
        Ok(dropped)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let (purged,): (i64,) = sqlx::query_as("SELECT pgmq.purge_queue($1)")
            .bind(queue)
            .fetch_one(self.pool())
            .await?;
        record_op(queue, "purge");
        Ok(purged.max(0) as u64)
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT queue_name FROM pgmq.list_queues() ORDER BY queue_name")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics> {
        let row = sqlx::query_as::<_, (String, i64, Option<i32>, Option<i32>, i64, DateTime<Utc>)>(
            "SELECT queue_name, queue_length, newest_msg_age_sec, oldest_msg_age_sec, total_messages, scrape_time
             FROM pgmq.metrics($1)",
        )
        .bind(queue)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        let (queue_name, queue_length, newest_msg_age_sec, oldest_msg_age_sec, total_messages, scrape_time) = row;
        Ok(QueueMetrics {
            queue_name,
            queue_length,
            newest_msg_age_sec,
            oldest_msg_age_sec,
            total_messages,
            scrape_time,
        })
    }
}
