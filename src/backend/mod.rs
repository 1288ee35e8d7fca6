//! Queue backend capability.
//!
//! The dispatcher depends only on [`QueueBackend`]. Each storage engine
//! provides one adapter: [`InMemoryBackend`] for tests and local runs, and
//! `db::Db` for pgmq on Postgres. Queue lifecycle lives on the separate
//! [`QueueAdmin`] trait so consumers never need admin rights.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::QueueOptions;
use crate::envelope::Envelope;
use crate::error::Result;

pub use memory::InMemoryBackend;

/// Backend-assigned message identifier, unique within a queue.
pub type MessageId = i64;

/// A temporary exclusive claim on one message.
///
/// Held only for one dispatch cycle: from `lease` until the message is
/// acked, nacked, dead-lettered or released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub queue: String,
    pub message_id: MessageId,
    /// Opaque. Resolution with a token that no longer matches is a no-op.
    pub token: String,
    /// When the message becomes visible again if the lease is not resolved.
    pub visible_at: DateTime<Utc>,
    /// Local monotonic bound on the lease, taken before the backend call
    /// that granted it, so it never runs past the backend's own clock.
    pub deadline: Instant,
    /// How many times the backend has handed this message out.
    pub read_count: i32,
}

/// A leased message with its undecoded body.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub lease: Lease,
    pub body: serde_json::Value,
}

/// Record written to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_queue: String,
    /// The envelope as last annotated, or the raw body if it failed to decode.
    pub message: serde_json::Value,
    pub reason: String,
    /// Final attempt count.
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
}

impl Lease {
    /// Time left before the message can be handed to someone else.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl DeadLetter {
    pub fn new(
        source_queue: impl Into<String>,
        message: serde_json::Value,
        reason: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            source_queue: source_queue.into(),
            message,
            reason: reason.into(),
            attempt,
            failed_at: Utc::now(),
        }
    }
}

/// Resolution methods return `Ok(false)` when `lease` is no longer the
/// message's current lease (it expired and was re-leased, or the message is
/// gone). Nothing is changed in that case.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store an envelope, visible after `delay`.
    async fn enqueue(&self, queue: &str, envelope: &Envelope, delay: Duration)
    -> Result<MessageId>;

    /// Lease up to `max` visible messages for `lease_duration`. Empty when idle.
    async fn lease(
        &self,
        queue: &str,
        max: usize,
        lease_duration: Duration,
    ) -> Result<Vec<LeasedMessage>>;

    /// Remove (or archive) the message. Idempotent.
    async fn ack(&self, lease: &Lease) -> Result<bool>;

    /// Replace the message body with `envelope` and make it visible after `delay`.
    async fn nack(&self, lease: &Lease, envelope: &Envelope, delay: Duration) -> Result<bool>;

    /// Move the message to the dead-letter destination of its queue.
    async fn dead_letter(&self, lease: &Lease, record: &DeadLetter) -> Result<bool>;

    /// Push the lease's visibility deadline to `now + duration`.
    ///
    /// Returns the lease to resolve with from now on, or `None` if `lease`
    /// is no longer current.
    async fn extend_lease(&self, lease: &Lease, duration: Duration) -> Result<Option<Lease>>;

    /// Make the message visible now, body untouched.
    async fn release(&self, lease: &Lease) -> Result<bool> {
        Ok(self.extend_lease(lease, Duration::ZERO).await?.is_some())
    }
}

/// Queue depth and age snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub queue_length: i64,
    pub newest_msg_age_sec: Option<i32>,
    pub oldest_msg_age_sec: Option<i32>,
    /// Messages ever sent to the queue.
    pub total_messages: i64,
    pub scrape_time: DateTime<Utc>,
}

#[async_trait]
pub trait QueueAdmin: Send + Sync {
    /// Create a queue. Creating an existing queue is a no-op.
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    /// Returns false if the queue did not exist.
    async fn drop_queue(&self, queue: &str) -> Result<bool>;

    /// Delete every message; returns how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u64>;

    async fn list_queues(&self) -> Result<Vec<String>>;

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics>;
}
