//! Retry decisions for failed messages and backoff for backend calls.

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::handler::FailureKind;

/// What to do with a failed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Make the message visible again after `delay`.
    Retry { delay: Duration },
    /// Move the message to the dead-letter queue.
    DeadLetter { reason: String },
}

/// Exponential backoff with a ceiling on attempts.
///
/// `delay = min(max_delay, base_delay * 2^(attempt-1)) + jitter`, where the
/// jitter is drawn uniformly from `[0, jitter * delay]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Jitter ratio in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "retry jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "retry base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Decide the fate of delivery attempt `attempt` (1-based).
    ///
    /// Deterministic for a given `(attempt, kind, jitter_seed)`.
    pub fn decide(&self, attempt: u32, kind: FailureKind, jitter_seed: u64) -> Decision {
        match kind {
            FailureKind::Fatal => Decision::DeadLetter {
                reason: format!("fatal failure on attempt {attempt}"),
            },
            FailureKind::Retryable if attempt >= self.max_attempts => Decision::DeadLetter {
                reason: format!("exhausted {attempt}/{} attempts", self.max_attempts),
            },
            FailureKind::Retryable => Decision::Retry {
                delay: self.delay_for(attempt, jitter_seed),
            },
        }
    }

    /// Backoff before the attempt following `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32, jitter_seed: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let mut rng = StdRng::seed_from_u64(jitter_seed);
        let spread = backoff.as_secs_f64() * self.jitter.min(1.0);
        let extra =
            Duration::try_from_secs_f64(rng.gen_range(0.0..=spread)).unwrap_or(Duration::MAX);
        backoff.saturating_add(extra)
    }
}

/// Jitter seed derived from message identity, so a redelivered decision is reproducible.
pub fn jitter_seed(message_id: i64, attempt: u32) -> u64 {
    (message_id as u64).rotate_left(17) ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ---------------------------------------------------------------------------
// Backend call backoff
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for lease/ack/nack calls.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackendRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackendRetry {
    /// Run `op`, retrying transient errors. Non-transient errors and the last
    /// transient one are returned to the caller.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self
                        .base_delay
                        .checked_mul(1u32 << (attempt - 1).min(31))
                        .unwrap_or(self.max_delay)
                        .min(self.max_delay);
                    warn!(operation, attempt, ?delay, "backend call failed, backing off: {e}");
                    crate::telemetry::metrics::backend_retries().add(
                        1,
                        &[opentelemetry::KeyValue::new("operation", operation.to_string())],
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
