//! Structured events emitted by the engine on every lease resolution.
//!
//! Consumers subscribe to the event stream to build dashboards,
//! alerting, or audit logs. Events carrying a `target_id` form the
//! cross-queue audit trail for that subject.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::correlation::CorrelationState;
use crate::telemetry::metrics;

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Leased {
        queue: String,
        message_id: i64,
        attempt: u32,
        correlation_id: Option<String>,
        target_id: Option<String>,
    },
    Acked {
        queue: String,
        message_id: i64,
        attempt: u32,
        correlation_id: Option<String>,
        target_id: Option<String>,
        duration_ms: u64,
    },
    RetryScheduled {
        queue: String,
        message_id: i64,
        /// Attempt number of the redelivery.
        next_attempt: u32,
        delay_ms: u64,
        error: String,
        target_id: Option<String>,
    },
    DeadLettered {
        queue: String,
        message_id: i64,
        attempt: u32,
        reason: String,
        correlation_id: Option<String>,
        target_id: Option<String>,
    },
    Released {
        queue: String,
        message_id: i64,
        reason: String,
    },
    ValidationFailed {
        queue: String,
        message_id: i64,
        error: String,
    },
    /// The lease expired before it could be resolved; nothing was counted.
    LeaseLost {
        queue: String,
        message_id: i64,
        operation: String,
    },
    CorrelationTransition {
        correlation_id: String,
        from: CorrelationState,
        to: CorrelationState,
        completed_count: u32,
        failed_count: u32,
    },
    BackendUnhealthy {
        operation: String,
        error: String,
    },
    BackendRecovered {
        operation: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Leased { .. } => "leased",
            EventKind::Acked { .. } => "acked",
            EventKind::RetryScheduled { .. } => "retry_scheduled",
            EventKind::DeadLettered { .. } => "dead_lettered",
            EventKind::Released { .. } => "released",
            EventKind::ValidationFailed { .. } => "validation_failed",
            EventKind::LeaseLost { .. } => "lease_lost",
            EventKind::CorrelationTransition { .. } => "correlation_transition",
            EventKind::BackendUnhealthy { .. } => "backend_unhealthy",
            EventKind::BackendRecovered { .. } => "backend_recovered",
        }
    }
}

/// Fan-out point for engine events: log, count, broadcast.
pub struct EventBus {
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it misses events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind) -> Event {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        log_event(&event);
        record_metrics(&event.kind);
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
        event
    }
}

fn log_event(event: &Event) {
    let seq = event.seq;
    match &event.kind {
        EventKind::Leased {
            queue,
            message_id,
            attempt,
            correlation_id,
            target_id,
        } => info!(seq, %queue, message_id, attempt, ?correlation_id, ?target_id, "leased"),
        EventKind::Acked {
            queue,
            message_id,
            attempt,
            target_id,
            duration_ms,
            ..
        } => info!(seq, %queue, message_id, attempt, ?target_id, duration_ms, "acked"),
        EventKind::RetryScheduled {
            queue,
            message_id,
            next_attempt,
            delay_ms,
            error,
            ..
        } => warn!(seq, %queue, message_id, next_attempt, delay_ms, %error, "retry scheduled"),
        EventKind::DeadLettered {
            queue,
            message_id,
            attempt,
            reason,
            target_id,
            ..
        } => warn!(seq, %queue, message_id, attempt, ?target_id, %reason, "dead-lettered"),
        EventKind::Released {
            queue,
            message_id,
            reason,
        } => info!(seq, %queue, message_id, %reason, "lease released"),
        EventKind::ValidationFailed {
            queue,
            message_id,
            error,
        } => warn!(seq, %queue, message_id, %error, "validation failed"),
        EventKind::LeaseLost {
            queue,
            message_id,
            operation,
        } => warn!(seq, %queue, message_id, %operation, "lease lost"),
        EventKind::CorrelationTransition {
            correlation_id,
            from,
            to,
            completed_count,
            failed_count,
        } => info!(
            seq,
            %correlation_id,
            from = %from,
            to = %to,
            completed_count,
            failed_count,
            "correlation transition"
        ),
        EventKind::BackendUnhealthy { operation, error } => {
            warn!(seq, %operation, %error, "backend unhealthy")
        }
        EventKind::BackendRecovered { operation } => info!(seq, %operation, "backend recovered"),
    }
}

fn record_metrics(kind: &EventKind) {
    match kind {
        EventKind::Leased { queue, .. } => {
            metrics::messages_leased().add(1, &[KeyValue::new("queue", queue.clone())])
        }
        EventKind::Acked {
            queue, duration_ms, ..
        } => {
            metrics::messages_acked().add(1, &[KeyValue::new("queue", queue.clone())]);
            metrics::handler_duration_ms()
                .record(*duration_ms as f64, &[KeyValue::new("queue", queue.clone())]);
        }
        EventKind::RetryScheduled { queue, .. } => {
            metrics::messages_retried().add(1, &[KeyValue::new("queue", queue.clone())])
        }
        EventKind::DeadLettered { queue, .. } => {
            metrics::messages_dead_lettered().add(1, &[KeyValue::new("queue", queue.clone())])
        }
        EventKind::Released { queue, .. } => {
            metrics::messages_released().add(1, &[KeyValue::new("queue", queue.clone())])
        }
        EventKind::CorrelationTransition { to, .. } => metrics::correlation_transitions()
            .add(1, &[KeyValue::new("to", to.as_str())]),
        EventKind::ValidationFailed { .. }
        | EventKind::LeaseLost { .. }
        | EventKind::BackendUnhealthy { .. }
        | EventKind::BackendRecovered { .. } => {}
    }
}
