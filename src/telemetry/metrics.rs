//! Metric instrument factories for msgbus-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"msgbus-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for msgbus-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("msgbus-rs")
}

/// Counter: messages leased from a queue.
/// Labels: `queue`.
pub fn messages_leased() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.messages.leased")
        .with_description("Number of messages leased")
        .build()
}

/// Counter: messages handled successfully and removed.
/// Labels: `queue`.
pub fn messages_acked() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.messages.acked")
        .with_description("Number of messages acknowledged")
        .build()
}

/// Counter: failed messages scheduled for redelivery.
/// Labels: `queue`.
pub fn messages_retried() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.messages.retried")
        .with_description("Number of messages scheduled for retry")
        .build()
}

/// Counter: messages moved to a dead-letter queue.
/// Labels: `queue`.
pub fn messages_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.messages.dead_lettered")
        .with_description("Number of messages dead-lettered")
        .build()
}

/// Counter: leases given back unresolved (validate-only runs, shutdown).
/// Labels: `queue`.
pub fn messages_released() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.messages.released")
        .with_description("Number of leases released without resolution")
        .build()
}

/// Histogram: handler execution time for acked messages.
/// Labels: `queue`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("msgbus.handler.duration_ms")
        .with_description("Handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: backend calls retried after a transient failure.
/// Labels: `operation`.
pub fn backend_retries() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.backend.retries")
        .with_description("Number of backend call retries")
        .build()
}

/// Counter: queue-level operations (send, read, archive, delete, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: correlation state transitions.
/// Labels: `to`.
pub fn correlation_transitions() -> Counter<u64> {
    meter()
        .u64_counter("msgbus.correlation.transitions")
        .with_description("Number of correlation state transitions")
        .build()
}
