//! # msgbus-rs
//!
//! Postgres-backed message bus engine.
//!
//! Leases messages from durable queues (pgmq), dispatches each to the
//! handler registered for its queue, and resolves the lease by ack, retry
//! with backoff, or dead-letter. Correlation tracking answers whether a
//! unit of work and everything it fanned out into has finished.

pub mod backend;
pub mod config;
pub mod correlation;
pub mod db;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod handlers;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use backend::{DeadLetter, InMemoryBackend, Lease, MessageId, QueueAdmin, QueueBackend};
pub use correlation::{CorrelationConfig, CorrelationStatus, CorrelationTracker};
pub use engine::{Dispatcher, Health, RunStats};
pub use envelope::{Envelope, Meta, Version};
pub use error::{Error, Result};
pub use handler::{FailureKind, Handler, HandlerContext, HandlerError, HandlerResult};
pub use producer::{EnqueueOptions, Producer};
pub use registry::HandlerRegistry;
pub use retry::{Decision, RetryPolicy};
