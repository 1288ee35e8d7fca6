//! Per-message lifecycle: LEASED -> HANDLING -> {ACKED | RETRY_SCHEDULED | DEAD_LETTERED}.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::dispatcher::Core;
use crate::backend::{DeadLetter, Lease, LeasedMessage};
use crate::config::DispatchMode;
use crate::envelope::{DecodeError, Envelope};
use crate::event::EventKind;
use crate::handler::{FailureKind, Handler, HandlerContext, HandlerError, HandlerResult};
use crate::retry::{Decision, jitter_seed};
use crate::telemetry::dispatch::{record_resolution, start_message_span};

/// How a worker finished with one leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Acked,
    Retried,
    DeadLettered,
    /// Given back unresolved, body untouched.
    Released,
    /// Validate-only run; the lease is left to expire.
    Validated,
    /// The lease expired before resolution and someone else may hold the
    /// message now. Nothing was counted.
    LeaseLost,
    /// Resolution failed at the backend; the lease will expire on its own.
    Unresolved,
}

/// Outcome of running the handler for one attempt.
enum Invocation {
    Finished(HandlerResult),
    /// Shutdown grace ran out while the handler was still running.
    Forced,
}

impl Core {
    pub(crate) async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<LeasedMessage>>>,
        stop: CancellationToken,
        force: CancellationToken,
    ) {
        debug!(worker_id, "worker started");
        loop {
            let next = rx.lock().await.recv().await;
            let Some(msg) = next else { break };

            if stop.is_cancelled() {
                self.release(&msg.lease, "shutdown").await;
                continue;
            }

            let resolution = self.process(msg, &force).await;
            self.counters.record(resolution);

            if self.cap_reached() && !stop.is_cancelled() {
                info!(max_messages = ?self.config.max_messages, "message cap reached");
                stop.cancel();
            }
        }
        debug!(worker_id, "worker stopped");
    }

    /// Take one leased message through to resolution.
    pub(crate) async fn process(&self, msg: LeasedMessage, force: &CancellationToken) -> Resolution {
        let LeasedMessage { lease, body } = msg;
        let mut lease = match self.ensure_lease_time(lease).await {
            Ok(lease) => lease,
            Err(resolution) => return resolution,
        };
        match Envelope::from_value(body.clone()) {
            Ok(envelope) => {
                let span = start_message_span(&lease.queue, lease.message_id, envelope.meta.attempt);
                self.dispatch(&mut lease, envelope, force)
                    .instrument(span)
                    .await
            }
            Err(e) => self.reject_undecodable(&lease, body, e).await,
        }
    }

    /// A message can sit in the work buffer after it was leased. Refresh
    /// the lease when what is left of it would not cover the handler.
    async fn ensure_lease_time(&self, lease: Lease) -> Result<Lease, Resolution> {
        let needed = self.config.handler_timeout.min(self.config.lease_duration);
        if lease.remaining() >= needed {
            return Ok(lease);
        }
        let refreshed = self
            .call("extend_lease", || {
                self.backend.extend_lease(&lease, self.config.lease_duration)
            })
            .await;
        match refreshed {
            Ok(Some(refreshed)) => {
                debug!(
                    queue = %lease.queue,
                    message_id = lease.message_id,
                    remaining = ?lease.remaining(),
                    "lease refreshed before handling"
                );
                Ok(refreshed)
            }
            Ok(None) => Err(self.lease_lost(&lease, "extend_lease")),
            Err(e) => {
                warn!(queue = %lease.queue, message_id = lease.message_id, error = %e, "could not refresh lease, leaving it to expire");
                Err(Resolution::Unresolved)
            }
        }
    }

    async fn dispatch(
        &self,
        lease: &mut Lease,
        mut envelope: Envelope,
        force: &CancellationToken,
    ) -> Resolution {
        let validate_only = self.config.mode == DispatchMode::ValidateOnly;

        if envelope.meta.queue_name != lease.queue {
            let err = HandlerError::fatal(format!(
                "meta.queue_name {:?} does not match queue {:?}",
                envelope.meta.queue_name, lease.queue
            ));
            if validate_only {
                return self.validation_failed(lease, &err);
            }
            envelope.annotate_failure(&err);
            return self.dead_letter(lease, envelope, err.message).await;
        }

        let handler = match self.registry.resolve(&lease.queue) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(queue = %lease.queue, error = %e, "no handler, releasing lease");
                self.release(lease, "no handler").await;
                return Resolution::Released;
            }
        };

        if let Some(correlation_id) = &envelope.meta.correlation_id {
            self.touch_correlation(correlation_id).await;
        }
        self.events.emit(EventKind::Leased {
            queue: lease.queue.clone(),
            message_id: lease.message_id,
            attempt: envelope.meta.attempt,
            correlation_id: envelope.meta.correlation_id.clone(),
            target_id: envelope.meta.target_id.clone(),
        });

        if validate_only {
            return self.validate_only(lease, &envelope, handler).await;
        }

        let started = Instant::now();
        match self.invoke(lease, &envelope, handler, force).await {
            Invocation::Finished(Ok(())) => self.ack(lease, &envelope, started).await,
            Invocation::Finished(Err(err)) => self.fail(lease, envelope, err).await,
            Invocation::Forced => {
                self.release(lease, "shutdown grace elapsed").await;
                Resolution::Released
            }
        }
    }

    /// Run validate + handle on its own task, bounded by the handler timeout.
    async fn invoke(
        &self,
        lease: &mut Lease,
        envelope: &Envelope,
        handler: Arc<dyn Handler>,
        force: &CancellationToken,
    ) -> Invocation {
        let cancel = force.child_token();
        let deadline = Instant::now() + self.config.handler_timeout;
        let ctx = HandlerContext::new(lease.queue.clone(), lease.message_id, deadline, cancel.clone());
        let env = envelope.clone();

        let mut task = tokio::spawn(
            async move {
                handler.validate(&env).await.map_err(|e| HandlerError {
                    kind: FailureKind::Fatal,
                    ..e
                })?;
                handler.handle(&env, &ctx).await
            }
            .in_current_span(),
        );

        tokio::select! {
            biased;
            joined = &mut task => Invocation::Finished(match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(HandlerError::retryable(format!(
                    "handler panicked: {}",
                    panic_message(e.into_panic())
                ))),
                Err(e) => Err(HandlerError::retryable(format!("handler task failed: {e}"))),
            }),
            _ = sleep_until(deadline) => {
                cancel.cancel();
                Invocation::Finished(Err(HandlerError::retryable(format!(
                    "handler timed out after {:?}",
                    self.config.handler_timeout
                ))))
            }
            _ = force.cancelled() => {
                cancel.cancel();
                Invocation::Forced
            }
            never = self.keep_lease_alive(lease) => match never {},
        }
    }

    async fn ack(&self, lease: &Lease, envelope: &Envelope, started: Instant) -> Resolution {
        match self.call("ack", || self.backend.ack(lease)).await {
            Ok(true) => {}
            Ok(false) => return self.lease_lost(lease, "ack"),
            Err(e) => {
                error!(queue = %lease.queue, message_id = lease.message_id, error = %e, "ack failed, message will be redelivered");
                return Resolution::Unresolved;
            }
        }
        record_resolution(&Span::current(), "handling", "acked");
        self.events.emit(EventKind::Acked {
            queue: lease.queue.clone(),
            message_id: lease.message_id,
            attempt: envelope.meta.attempt,
            correlation_id: envelope.meta.correlation_id.clone(),
            target_id: envelope.meta.target_id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.note_outcome(lease, envelope, true).await;
        Resolution::Acked
    }

    async fn fail(&self, lease: &Lease, mut envelope: Envelope, err: HandlerError) -> Resolution {
        let attempt = envelope.meta.attempt;
        envelope.annotate_failure(&err);
        let seed = jitter_seed(lease.message_id, attempt);
        match self.policy.decide(attempt, err.kind, seed) {
            Decision::Retry { delay } => {
                envelope.meta.attempt = attempt.saturating_add(1);
                match self
                    .call("nack", || self.backend.nack(lease, &envelope, delay))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => return self.lease_lost(lease, "nack"),
                    Err(e) => {
                        error!(queue = %lease.queue, message_id = lease.message_id, error = %e, "nack failed, message will be redelivered");
                        return Resolution::Unresolved;
                    }
                }
                record_resolution(&Span::current(), "handling", "retry_scheduled");
                self.events.emit(EventKind::RetryScheduled {
                    queue: lease.queue.clone(),
                    message_id: lease.message_id,
                    next_attempt: envelope.meta.attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: err.message,
                    target_id: envelope.meta.target_id.clone(),
                });
                Resolution::Retried
            }
            Decision::DeadLetter { reason } => {
                self.dead_letter(lease, envelope, format!("{reason}: {}", err.message))
                    .await
            }
        }
    }

    async fn dead_letter(&self, lease: &Lease, envelope: Envelope, reason: String) -> Resolution {
        let record = DeadLetter::new(
            lease.queue.clone(),
            envelope.to_value(),
            reason.clone(),
            envelope.meta.attempt,
        );
        if let Some(unresolved) = self.send_dead_letter(lease, &record).await {
            return unresolved;
        }
        record_resolution(&Span::current(), "handling", "dead_lettered");
        self.events.emit(EventKind::DeadLettered {
            queue: lease.queue.clone(),
            message_id: lease.message_id,
            attempt: envelope.meta.attempt,
            reason,
            correlation_id: envelope.meta.correlation_id.clone(),
            target_id: envelope.meta.target_id.clone(),
        });
        self.note_outcome(lease, &envelope, false).await;
        Resolution::DeadLettered
    }

    /// `Some` with the resolution to report when the record was not written.
    async fn send_dead_letter(&self, lease: &Lease, record: &DeadLetter) -> Option<Resolution> {
        match self
            .call("dead_letter", || self.backend.dead_letter(lease, record))
            .await
        {
            Ok(true) => None,
            Ok(false) => Some(self.lease_lost(lease, "dead_letter")),
            Err(e) => {
                error!(queue = %lease.queue, message_id = lease.message_id, error = %e, "dead-letter failed, message will be redelivered");
                Some(Resolution::Unresolved)
            }
        }
    }

    fn lease_lost(&self, lease: &Lease, operation: &str) -> Resolution {
        self.events.emit(EventKind::LeaseLost {
            queue: lease.queue.clone(),
            message_id: lease.message_id,
            operation: operation.to_string(),
        });
        Resolution::LeaseLost
    }

    /// A body that is not an envelope can never be handled.
    async fn reject_undecodable(
        &self,
        lease: &Lease,
        body: serde_json::Value,
        err: DecodeError,
    ) -> Resolution {
        let reason = format!("decode error: {err}");
        if self.config.mode == DispatchMode::ValidateOnly {
            return self.validation_failed(lease, &HandlerError::fatal(reason));
        }
        let attempt = u32::try_from(lease.read_count.max(1)).unwrap_or(1);
        let record = DeadLetter::new(lease.queue.clone(), body, reason.clone(), attempt);
        if let Some(unresolved) = self.send_dead_letter(lease, &record).await {
            return unresolved;
        }
        self.events.emit(EventKind::DeadLettered {
            queue: lease.queue.clone(),
            message_id: lease.message_id,
            attempt,
            reason,
            correlation_id: None,
            target_id: None,
        });
        Resolution::DeadLettered
    }

    async fn validate_only(
        &self,
        lease: &Lease,
        envelope: &Envelope,
        handler: Arc<dyn Handler>,
    ) -> Resolution {
        let env = envelope.clone();
        let task = tokio::spawn(async move { handler.validate(&env).await });
        let result = match timeout(self.config.handler_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(HandlerError::fatal(format!("validation task failed: {e}"))),
            Err(_) => Err(HandlerError::retryable("validation timed out")),
        };
        match result {
            Ok(()) => {
                debug!(queue = %lease.queue, message_id = lease.message_id, "valid");
                Resolution::Validated
            }
            Err(err) => self.validation_failed(lease, &err),
        }
    }

    /// Report a validation failure. The lease is left to expire, so each
    /// message is checked once per run.
    fn validation_failed(&self, lease: &Lease, err: &HandlerError) -> Resolution {
        self.events.emit(EventKind::ValidationFailed {
            queue: lease.queue.clone(),
            message_id: lease.message_id,
            error: err.message.clone(),
        });
        Resolution::Validated
    }

    /// Make a leased message visible again without touching it.
    pub(crate) async fn release(&self, lease: &Lease, reason: &str) {
        match self.call("release", || self.backend.release(lease)).await {
            Ok(false) => {
                debug!(queue = %lease.queue, message_id = lease.message_id, "release on stale lease ignored");
            }
            Ok(true) => {
                self.counters.released();
                self.events.emit(EventKind::Released {
                    queue: lease.queue.clone(),
                    message_id: lease.message_id,
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                warn!(queue = %lease.queue, message_id = lease.message_id, error = %e, "release failed, lease will expire");
            }
        }
    }

    async fn touch_correlation(&self, correlation_id: &str) {
        let Some(tracker) = &self.tracker else { return };
        if let Err(e) = self
            .backend_retry
            .run("correlation_touch", || tracker.touch(correlation_id))
            .await
        {
            warn!(correlation_id, error = %e, "correlation touch failed");
        }
    }

    /// Count the outcome against the message's correlation, once per message.
    async fn note_outcome(&self, lease: &Lease, envelope: &Envelope, succeeded: bool) {
        let (Some(tracker), Some(correlation_id)) = (&self.tracker, &envelope.meta.correlation_id)
        else {
            return;
        };
        let key = format!("{}:{}", lease.queue, lease.message_id);
        if let Err(e) = self
            .backend_retry
            .run("correlation_outcome", || {
                tracker.note_message_outcome(correlation_id, &key, succeeded)
            })
            .await
        {
            error!(%correlation_id, succeeded, error = %e, "correlation update failed");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
