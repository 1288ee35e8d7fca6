//! Message dispatch span helpers.
//!
//! Provides span creation and state-transition recording for messages
//! flowing through the dispatcher.

use tracing::Span;

/// Start a span covering one delivery attempt of a message.
///
/// The `message.state` field is declared empty and can be updated via
/// [`record_resolution`].
pub fn start_message_span(queue: &str, message_id: i64, attempt: u32) -> Span {
    tracing::info_span!(
        "message.dispatch",
        "messaging.destination.name" = queue,
        "messaging.message.id" = message_id,
        "message.attempt" = attempt,
        "message.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Emits a tracing `info` event scoped to the span and stores the new state.
pub fn record_resolution(span: &Span, from: &str, to: &str) {
    span.record("message.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
