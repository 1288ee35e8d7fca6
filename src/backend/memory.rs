//! In-process queue backend.
//!
//! Mirrors pgmq semantics closely enough for the dispatcher to be tested
//! without Postgres: visibility timeouts, read counts, archive, and a
//! `<queue>_dlq` dead-letter queue per source queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{DeadLetter, Lease, LeasedMessage, MessageId, QueueAdmin, QueueBackend, QueueMetrics};
use crate::config::{AckMode, QueueOptions};
use crate::envelope::Envelope;
use crate::error::{Error, Result};

const DEAD_LETTER_SUFFIX: &str = "_dlq";

#[derive(Debug, Clone)]
struct Stored {
    body: serde_json::Value,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    read_count: i32,
    /// Token of the current lease, if any.
    token: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: BTreeMap<MessageId, Stored>,
    archive: Vec<(MessageId, serde_json::Value)>,
    total_sent: i64,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    next_id: MessageId,
}

impl Inner {
    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    fn push(&mut self, queue: &str, body: serde_json::Value, delay: Duration) -> Result<MessageId> {
        self.next_id += 1;
        let id = self.next_id;
        let state = self.queue_mut(queue)?;
        state.messages.insert(
            id,
            Stored {
                body,
                enqueued_at: Utc::now(),
                visible_at: Instant::now() + delay,
                read_count: 0,
                token: None,
            },
        );
        state.total_sent += 1;
        Ok(id)
    }

    /// The stored message, only while `lease` is still its current lease.
    fn leased_mut(&mut self, lease: &Lease) -> Option<&mut Stored> {
        self.queues
            .get_mut(&lease.queue)?
            .messages
            .get_mut(&lease.message_id)
            .filter(|m| m.token.as_deref() == Some(lease.token.as_str()))
    }
}

fn wall_clock_after(duration: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Queue backend held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
    ack_mode: AckMode,
    /// Number of upcoming calls that fail with a transient error.
    injected_failures: AtomicU32,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Backend with `queues` (and their dead-letter queues) already created.
    pub fn with_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = Inner::default();
        for q in queues {
            let q = q.as_ref();
            inner.queues.entry(q.to_string()).or_default();
            inner
                .queues
                .entry(format!("{q}{DEAD_LETTER_SUFFIX}"))
                .or_default();
        }
        Self {
            inner: Mutex::new(inner),
            ..Self::default()
        }
    }

    /// Make the next `n` backend calls fail with `Error::Backend`.
    pub fn inject_failures(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    fn check_injected(&self, operation: &str) -> Result<()> {
        let took = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(Error::Backend(format!("injected failure during {operation}"))),
            Err(_) => Ok(()),
        }
    }

    /// Store an arbitrary body, envelope or not.
    pub async fn enqueue_raw(&self, queue: &str, body: serde_json::Value) -> Result<MessageId> {
        self.inner.lock().await.push(queue, body, Duration::ZERO)
    }

    /// Make a leased message visible now, as if its lease had run out. The
    /// holder keeps its token until someone else leases the message.
    pub async fn expire_lease(&self, queue: &str, message_id: MessageId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.get_mut(&message_id))
        else {
            return false;
        };
        stored.visible_at = Instant::now();
        true
    }

    // -- inspection ---------------------------------------------------------

    /// Current body of a message still in the queue (leased or not).
    pub async fn peek(&self, queue: &str, message_id: MessageId) -> Option<Envelope> {
        let inner = self.inner.lock().await;
        let stored = inner.queues.get(queue)?.messages.get(&message_id)?;
        Envelope::from_value(stored.body.clone()).ok()
    }

    /// Messages in the queue, visible or not.
    pub async fn depth(&self, queue: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.get(queue).map_or(0, |q| q.messages.len())
    }

    pub async fn archived(&self, queue: &str) -> Vec<serde_json::Value> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(queue)
            .map(|q| q.archive.iter().map(|(_, body)| body.clone()).collect())
            .unwrap_or_default()
    }

    /// Dead letters recorded for `queue`, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(&format!("{queue}{DEAD_LETTER_SUFFIX}"))
            .map(|q| {
                q.messages
                    .values()
                    .filter_map(|m| serde_json::from_value(m.body.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn enqueue(
        &self,
        queue: &str,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<MessageId> {
        self.check_injected("enqueue")?;
        envelope.check()?;
        self.inner
            .lock()
            .await
            .push(queue, envelope.to_value(), delay)
    }

    async fn lease(
        &self,
        queue: &str,
        max: usize,
        lease_duration: Duration,
    ) -> Result<Vec<LeasedMessage>> {
        self.check_injected("lease")?;
        let mut inner = self.inner.lock().await;
        let state = inner.queue_mut(queue)?;
        let now = Instant::now();
        let visible_at = wall_clock_after(lease_duration);

        let mut batch = Vec::new();
        for (&id, stored) in state.messages.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            let token = Uuid::new_v4().to_string();
            stored.visible_at = now + lease_duration;
            stored.read_count += 1;
            stored.token = Some(token.clone());
            batch.push(LeasedMessage {
                lease: Lease {
                    queue: queue.to_string(),
                    message_id: id,
                    token,
                    visible_at,
                    deadline: stored.visible_at,
                    read_count: stored.read_count,
                },
                body: stored.body.clone(),
            });
        }
        Ok(batch)
    }

    async fn ack(&self, lease: &Lease) -> Result<bool> {
        self.check_injected("ack")?;
        let mut inner = self.inner.lock().await;
        if inner.leased_mut(lease).is_none() {
            debug!(queue = %lease.queue, message_id = lease.message_id, "ack on stale lease ignored");
            return Ok(false);
        }
        let state = inner.queue_mut(&lease.queue)?;
        let removed = state.messages.remove(&lease.message_id);
        if let (Some(stored), AckMode::Archive) = (removed, self.ack_mode) {
            state.archive.push((lease.message_id, stored.body));
        }
        Ok(true)
    }

    async fn nack(&self, lease: &Lease, envelope: &Envelope, delay: Duration) -> Result<bool> {
        self.check_injected("nack")?;
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.leased_mut(lease) else {
            debug!(queue = %lease.queue, message_id = lease.message_id, "nack on stale lease ignored");
            return Ok(false);
        };
        stored.body = envelope.to_value();
        stored.visible_at = Instant::now() + delay;
        stored.token = None;
        Ok(true)
    }

    async fn dead_letter(&self, lease: &Lease, record: &DeadLetter) -> Result<bool> {
        self.check_injected("dead_letter")?;
        let mut inner = self.inner.lock().await;
        if inner.leased_mut(lease).is_none() {
            debug!(queue = %lease.queue, message_id = lease.message_id, "dead-letter on stale lease ignored");
            return Ok(false);
        }
        let dlq = format!("{}{DEAD_LETTER_SUFFIX}", lease.queue);
        inner.queues.entry(dlq.clone()).or_default();
        let body = serde_json::to_value(record).map_err(|e| Error::Other(e.to_string()))?;
        inner.push(&dlq, body, Duration::ZERO)?;

        let state = inner.queue_mut(&lease.queue)?;
        if let Some(stored) = state.messages.remove(&lease.message_id) {
            state.archive.push((lease.message_id, stored.body));
        }
        Ok(true)
    }

    async fn extend_lease(&self, lease: &Lease, duration: Duration) -> Result<Option<Lease>> {
        self.check_injected("extend_lease")?;
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.leased_mut(lease) else {
            debug!(queue = %lease.queue, message_id = lease.message_id, "extend on stale lease ignored");
            return Ok(None);
        };
        stored.visible_at = Instant::now() + duration;
        if duration.is_zero() {
            stored.token = None;
        }
        Ok(Some(Lease {
            visible_at: wall_clock_after(duration),
            deadline: stored.visible_at,
            ..lease.clone()
        }))
    }
}

#[async_trait]
impl QueueAdmin for InMemoryBackend {
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        if options.partition.is_some() {
            debug!(queue, "partitioning ignored by in-memory backend");
        }
        self.inner
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_queue(&self, queue: &str) -> Result<bool> {
        Ok(self.inner.lock().await.queues.remove(queue).is_some())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let state = inner.queue_mut(queue)?;
        let purged = state.messages.len() as u64;
        state.messages.clear();
        Ok(purged)
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.inner.lock().await.queues.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics> {
        let mut inner = self.inner.lock().await;
        let state = inner.queue_mut(queue)?;
        let now = Utc::now();
        let age = |at: DateTime<Utc>| (now - at).num_seconds() as i32;
        let oldest = state.messages.values().map(|m| m.enqueued_at).min();
        let newest = state.messages.values().map(|m| m.enqueued_at).max();
        Ok(QueueMetrics {
            queue_name: queue.to_string(),
            queue_length: state.messages.len() as i64,
            newest_msg_age_sec: newest.map(age),
            oldest_msg_age_sec: oldest.map(age),
            total_messages: state.total_sent,
            scrape_time: now,
        })
    }
}
