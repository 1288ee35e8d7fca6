//! The dispatcher: lease loops feeding a bounded worker pool.
//!
//! One lease loop per queue reserves a slot in the bounded work channel
//! before every backend call, so a full pool pauses leasing instead of
//! piling up leases that would expire in the buffer. Workers share the
//! receiving end and resolve each message (see `worker.rs`).
//!
//! Shutdown: leasing stops at once, buffered messages are released,
//! in-flight handlers get `shutdown_grace` to finish and are then
//! cancelled, their leases released rather than acked.

use std::convert::Infallible;
use std::future::{Future, pending};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Lease, LeasedMessage, QueueBackend};
use crate::config::DispatchConfig;
use crate::correlation::CorrelationTracker;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::registry::HandlerRegistry;
use crate::retry::{BackendRetry, RetryPolicy};

use super::worker::Resolution;

/// Backend health as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// A backend call exhausted its retries.
    Unhealthy { operation: String, error: String },
}

/// Counts of lease resolutions since the dispatcher was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub released: u64,
    pub validated: u64,
    /// Leases that expired before they could be resolved.
    pub lost: u64,
    /// Messages a worker finished with, whatever the outcome.
    pub finished: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    released: AtomicU64,
    validated: AtomicU64,
    lost: AtomicU64,
    finished: AtomicU64,
    leased: AtomicU64,
}

impl Counters {
    pub(crate) fn record(&self, resolution: Resolution) {
        let counter = match resolution {
            Resolution::Acked => Some(&self.acked),
            Resolution::Retried => Some(&self.retried),
            Resolution::DeadLettered => Some(&self.dead_lettered),
            Resolution::Validated => Some(&self.validated),
            Resolution::LeaseLost => Some(&self.lost),
            // `released` is counted by `Core::release` itself.
            Resolution::Released | Resolution::Unresolved => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> RunStats {
        RunStats {
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            validated: self.validated.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
        }
    }
}

/// State shared by lease loops and workers.
pub(crate) struct Core {
    pub(crate) backend: Arc<dyn QueueBackend>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) policy: RetryPolicy,
    pub(crate) config: DispatchConfig,
    pub(crate) events: Arc<EventBus>,
    pub(crate) tracker: Option<CorrelationTracker>,
    pub(crate) backend_retry: BackendRetry,
    pub(crate) counters: Counters,
    health: watch::Sender<Health>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct DispatcherBuilder {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry>,
    policy: Option<RetryPolicy>,
    config: DispatchConfig,
    events: Option<Arc<EventBus>>,
    tracker: Option<CorrelationTracker>,
    backend_retry: BackendRetry,
}

impl DispatcherBuilder {
    /// Takes precedence over `config.retry`.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Dispatch settings. An empty `queues` list means every registered queue.
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tracker(mut self, tracker: CorrelationTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn backend_retry(mut self, backend_retry: BackendRetry) -> Self {
        self.backend_retry = backend_retry;
        self
    }

    /// Validate the configuration and check every queue has a handler.
    pub fn build(mut self) -> Result<Dispatcher> {
        if self.config.queues.is_empty() {
            self.config.queues = self.registry.queue_names();
        }
        if let Some(policy) = self.policy.take() {
            self.config.retry = policy;
        }
        self.config.validate()?;
        for queue in &self.config.queues {
            self.registry.resolve(queue)?;
        }

        let events = self.events.unwrap_or_default();
        let tracker = self.tracker.map(|t| t.with_events(Arc::clone(&events)));
        let (health, _) = watch::channel(Health::Healthy);

        Ok(Dispatcher {
            core: Arc::new(Core {
                backend: self.backend,
                registry: self.registry,
                policy: self.config.retry.clone(),
                config: self.config,
                events,
                tracker,
                backend_retry: self.backend_retry,
                counters: Counters::default(),
                health,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Leases messages, runs handlers, resolves leases.
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<Core>,
}

impl Dispatcher {
    pub fn builder(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<HandlerRegistry>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            backend,
            registry,
            policy: None,
            config: DispatchConfig::default(),
            events: None,
            tracker: None,
            backend_retry: BackendRetry::default(),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.core.events)
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.core.health.subscribe()
    }

    pub fn stats(&self) -> RunStats {
        self.core.counters.snapshot()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.core.config
    }

    /// Run until `shutdown` is cancelled or a run cap is reached.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunStats> {
        let core = &self.core;
        let config = &core.config;
        let stop = shutdown.child_token();
        let force = CancellationToken::new();

        let (tx, rx) = mpsc::channel::<LeasedMessage>(config.buffer);
        let rx = Arc::new(Mutex::new(rx));

        info!(
            queues = ?config.queues,
            workers = config.workers,
            mode = ?config.mode,
            "dispatcher starting"
        );

        let mut leasers = JoinSet::new();
        for queue in &config.queues {
            leasers.spawn(Arc::clone(core).lease_loop(queue.clone(), tx.clone(), stop.clone()));
        }
        drop(tx);

        let mut workers = JoinSet::new();
        for worker_id in 0..config.workers {
            workers.spawn(Arc::clone(core).worker_loop(
                worker_id,
                Arc::clone(&rx),
                stop.clone(),
                force.clone(),
            ));
        }

        let runtime_cap = async {
            match config.max_runtime {
                Some(limit) => sleep(limit).await,
                None => pending().await,
            }
        };
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = runtime_cap => {
                info!(max_runtime = ?config.max_runtime, "runtime cap reached");
                stop.cancel();
            }
        }

        info!("shutdown requested, leasing stopped");
        while let Some(joined) = leasers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "lease loop crashed");
            }
        }

        let drained = timeout(config.shutdown_grace, join_all(&mut workers)).await;
        if drained.is_err() {
            warn!(
                grace = ?config.shutdown_grace,
                "shutdown grace elapsed, releasing in-flight leases"
            );
            force.cancel();
            join_all(&mut workers).await;
        }

        let stats = core.counters.snapshot();
        info!(?stats, "dispatcher stopped");
        Ok(stats)
    }

    /// Lease one batch from `queue` and process it inline.
    ///
    /// Returns how many messages were leased.
    pub async fn dispatch_once(&self, queue: &str) -> Result<usize> {
        let core = &self.core;
        core.registry.resolve(queue)?;
        let batch = core
            .call("lease", || {
                core.backend
                    .lease(queue, core.config.batch_size, core.config.lease_duration)
            })
            .await?;

        let leased = batch.len();
        core.counters.leased.fetch_add(leased as u64, Ordering::Relaxed);
        let force = CancellationToken::new();
        for msg in batch {
            let resolution = core.process(msg, &force).await;
            core.counters.record(resolution);
        }
        Ok(leased)
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker crashed");
        }
    }
}

// ---------------------------------------------------------------------------
// Lease loop and backend calls
// ---------------------------------------------------------------------------

impl Core {
    async fn lease_loop(
        self: Arc<Self>,
        queue: String,
        tx: mpsc::Sender<LeasedMessage>,
        stop: CancellationToken,
    ) {
        debug!(%queue, "lease loop started");
        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // The permit holds one slot; whatever else is free may be filled too.
            let want = self.lease_budget((tx.capacity() + 1).min(self.config.batch_size));
            if want == 0 {
                drop(permit);
                stop.cancelled().await;
                break;
            }

            let batch = match self
                .call("lease", || {
                    self.backend
                        .lease(&queue, want, self.config.lease_duration)
                })
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(%queue, error = %e, "lease failed");
                    drop(permit);
                    if self.idle(&stop).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                drop(permit);
                if self.idle(&stop).await {
                    break;
                }
                continue;
            }

            self.counters
                .leased
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            let mut batch = batch.into_iter();
            if let Some(first) = batch.next() {
                permit.send(first);
            }
            for msg in batch {
                if let Err(mpsc::error::SendError(msg)) = tx.send(msg).await {
                    self.release(&msg.lease, "dispatcher stopped").await;
                }
            }
        }
        debug!(%queue, "lease loop stopped");
    }

    /// Wait one poll interval. True when shutdown arrived meanwhile.
    async fn idle(&self, stop: &CancellationToken) -> bool {
        tokio::select! {
            _ = stop.cancelled() => true,
            _ = sleep(self.config.poll_interval) => false,
        }
    }

    /// Cap a lease request by what remains of `max_messages`.
    fn lease_budget(&self, want: usize) -> usize {
        match self.config.max_messages {
            Some(max) => {
                let remaining = max.saturating_sub(self.counters.leased.load(Ordering::Relaxed));
                want.min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            None => want,
        }
    }

    /// True once `max_messages` messages have been finished.
    pub(crate) fn cap_reached(&self) -> bool {
        self.config
            .max_messages
            .is_some_and(|max| self.counters.finished() >= max)
    }

    /// Run a backend call with bounded backoff and track backend health.
    pub(crate) async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.backend_retry.run(operation, op).await;
        match &result {
            Ok(_) => self.mark_healthy(operation),
            Err(e) if e.is_transient() => self.mark_unhealthy(operation, e),
            Err(_) => {}
        }
        result
    }

    fn mark_healthy(&self, operation: &str) {
        let recovered = self.health.send_if_modified(|health| {
            if *health == Health::Healthy {
                return false;
            }
            *health = Health::Healthy;
            true
        });
        if recovered {
            self.events.emit(EventKind::BackendRecovered {
                operation: operation.to_string(),
            });
        }
    }

    fn mark_unhealthy(&self, operation: &str, error: &Error) {
        let previous = self.health.send_replace(Health::Unhealthy {
            operation: operation.to_string(),
            error: error.to_string(),
        });
        if previous == Health::Healthy {
            self.events.emit(EventKind::BackendUnhealthy {
                operation: operation.to_string(),
                error: error.to_string(),
            });
        }
    }

    /// Future that extends `lease` every half lease duration, forever,
    /// keeping `lease` current with each refreshed token.
    /// Never resolves when lease extension is off.
    pub(crate) async fn keep_lease_alive(&self, lease: &mut Lease) -> Infallible {
        if !self.config.extend_leases {
            return pending().await;
        }
        let period = (self.config.lease_duration / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let extended = self
                .call("extend_lease", || {
                    self.backend.extend_lease(lease, self.config.lease_duration)
                })
                .await;
            match extended {
                Ok(Some(refreshed)) => {
                    debug!(queue = %lease.queue, message_id = lease.message_id, "lease extended");
                    *lease = refreshed;
                }
                Ok(None) => {
                    warn!(queue = %lease.queue, message_id = lease.message_id, "lease lost, no longer extending");
                    return pending().await;
                }
                Err(e) => warn!(queue = %lease.queue, message_id = lease.message_id, error = %e, "lease extension failed"),
            }
        }
    }
}
