//! Dispatcher behaviour against the in-memory backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use msgbus_rs::backend::{InMemoryBackend, QueueBackend};
use msgbus_rs::config::{DispatchConfig, DispatchMode};
use msgbus_rs::correlation::{
    CorrelationConfig, CorrelationState, CorrelationStatus, CorrelationTracker,
};
use msgbus_rs::engine::{Dispatcher, Health};
use msgbus_rs::envelope::Envelope;
use msgbus_rs::error::Error;
use msgbus_rs::event::{Event, EventKind};
use msgbus_rs::handler::{Handler, HandlerContext, HandlerError, HandlerResult};
use msgbus_rs::registry::HandlerRegistry;
use msgbus_rs::retry::{BackendRetry, RetryPolicy};
use serde_json::json;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "ship_order";
const BILLING: &str = "bill_order";
const LEASE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Step {
    Ok,
    Retry,
    Fatal,
    Panic,
    /// Wait for the deadline signal, then report success too late.
    Hang,
    /// Ignore cancellation entirely.
    Stuck,
    /// Work for a while, then succeed.
    Sleep(Duration),
}

/// Handler that plays back a script of outcomes, then succeeds.
#[derive(Default)]
struct Scripted {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    invalid: bool,
}

impl Scripted {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            invalid: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl Handler for Scripted {
    async fn validate(&self, envelope: &Envelope) -> HandlerResult {
        if self.invalid {
            return Err(HandlerError::fatal(format!(
                "missing order_id in {}",
                envelope.data
            )));
        }
        Ok(())
    }

    async fn handle(&self, _envelope: &Envelope, ctx: &HandlerContext) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().await.pop_front().unwrap_or(Step::Ok);
        match step {
            Step::Ok => Ok(()),
            Step::Retry => Err(HandlerError::retryable("lock contention")),
            Step::Fatal => Err(HandlerError::fatal("malformed order")),
            Step::Panic => panic!("carrier API exploded"),
            Step::Hang => {
                ctx.cancelled().await;
                Ok(())
            }
            Step::Stuck => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(())
            }
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

/// Handler whose first invocation outlives its lease: the message becomes
/// visible again and another consumer takes it before the handler returns.
struct Overrun {
    backend: Arc<InMemoryBackend>,
    calls: AtomicU32,
}

impl Overrun {
    fn new(backend: Arc<InMemoryBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Handler for Overrun {
    async fn handle(&self, _envelope: &Envelope, ctx: &HandlerContext) -> HandlerResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            assert!(self.backend.expire_lease(&ctx.queue, ctx.message_id).await);
            let taken = self.backend.lease(&ctx.queue, 1, LEASE).await.unwrap();
            assert_eq!(taken.len(), 1);
        }
        Ok(())
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(60),
        max_attempts,
        jitter: 0.0,
    }
}

fn config() -> DispatchConfig {
    DispatchConfig {
        lease_duration: LEASE,
        handler_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(100),
        ..DispatchConfig::for_queues([QUEUE])
    }
}

struct Fixture {
    backend: Arc<InMemoryBackend>,
    tracker: CorrelationTracker,
    dispatcher: Dispatcher,
    events: broadcast::Receiver<Event>,
}

fn fixture(handler: Arc<dyn Handler>, policy: RetryPolicy, config: DispatchConfig) -> Fixture {
    let backend = Arc::new(InMemoryBackend::with_queues([QUEUE]));
    fixture_on(backend, [(QUEUE, handler)], Some(policy), config)
}

/// Fixture over a prepared backend. Without `policy` the dispatcher uses
/// `config.retry`.
fn fixture_on(
    backend: Arc<InMemoryBackend>,
    handlers: impl IntoIterator<Item = (&'static str, Arc<dyn Handler>)>,
    policy: Option<RetryPolicy>,
    config: DispatchConfig,
) -> Fixture {
    let mut registry = HandlerRegistry::empty();
    for (queue, handler) in handlers {
        registry.register(queue, handler).unwrap();
    }
    let tracker = CorrelationTracker::in_memory(CorrelationConfig::default());
    let mut builder = Dispatcher::builder(backend.clone(), Arc::new(registry));
    if let Some(policy) = policy {
        builder = builder.policy(policy);
    }
    let dispatcher = builder
        .config(config)
        .tracker(tracker.clone())
        .backend_retry(BackendRetry {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        })
        .build()
        .unwrap();
    let events = dispatcher.events().subscribe();
    Fixture {
        backend,
        tracker,
        dispatcher,
        events,
    }
}

fn order() -> Envelope {
    Envelope::new(QUEUE, json!({"order_id": 42}))
        .correlation_id("corr-1")
        .version(1u64)
}

fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

// ---------------------------------------------------------------------------
// Resolution paths
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retryable_then_ok() {
    let mut f = fixture(Scripted::new([Step::Retry]), policy(5), config());
    let id = f
        .backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    // First attempt fails retryably.
    assert_eq!(f.dispatcher.dispatch_once(QUEUE).await.unwrap(), 1);
    let requeued = f.backend.peek(QUEUE, id).await.unwrap();
    assert_eq!(requeued.meta.attempt, 2);
    assert_eq!(requeued.meta.error.as_deref(), Some("lock contention"));
    assert_eq!(
        f.tracker.status("corr-1").await.unwrap(),
        CorrelationStatus::Open
    );

    // Invisible until the backoff delay (2s for attempt 1) has passed.
    assert_eq!(f.dispatcher.dispatch_once(QUEUE).await.unwrap(), 0);
    tokio::time::advance(Duration::from_secs(2)).await;

    // Second attempt succeeds.
    assert_eq!(f.dispatcher.dispatch_once(QUEUE).await.unwrap(), 1);
    assert!(f.backend.peek(QUEUE, id).await.is_none());
    assert_eq!(f.backend.archived(QUEUE).await.len(), 1);
    let record = f.tracker.record("corr-1").await.unwrap().unwrap();
    assert_eq!(record.completed_count, 1);
    assert!(
        f.backend
            .lease(QUEUE, 10, LEASE)
            .await
            .unwrap()
            .is_empty()
    );

    let kinds = drain(&mut f.events);
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::RetryScheduled { next_attempt: 2, delay_ms: 2000, .. }
    )));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::Acked { attempt: 2, .. })));
    assert_eq!(f.dispatcher.stats().retried, 1);
    assert_eq!(f.dispatcher.stats().acked, 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_dead_letters_on_first_attempt() {
    let mut f = fixture(Scripted::new([Step::Fatal]), policy(5), config());
    f.backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let dead = f.backend.dead_letters(QUEUE).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 1);
    assert!(dead[0].reason.contains("malformed order"));
    let stored = Envelope::from_value(dead[0].message.clone()).unwrap();
    assert_eq!(stored.meta.error.as_deref(), Some("malformed order"));
    assert_eq!(f.backend.depth(QUEUE).await, 0);

    let record = f.tracker.record("corr-1").await.unwrap().unwrap();
    assert_eq!(record.failed_count, 1);
    assert!(drain(&mut f.events)
        .iter()
        .any(|k| matches!(k, EventKind::DeadLettered { attempt: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn retryable_dead_letters_exactly_at_max_attempts() {
    let handler = Scripted::new([Step::Retry; 10]);
    let f = fixture(handler.clone(), policy(3), config());
    let id = f
        .backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    for attempt in 1..=3u32 {
        assert!(f.backend.dead_letters(QUEUE).await.is_empty());
        if attempt > 1 {
            assert_eq!(f.backend.peek(QUEUE, id).await.unwrap().meta.attempt, attempt);
        }
        f.dispatcher.dispatch_once(QUEUE).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
    }

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let dead = f.backend.dead_letters(QUEUE).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
    assert!(dead[0].reason.contains("exhausted 3/3 attempts"));
    assert_eq!(f.dispatcher.stats().retried, 2);
}

#[tokio::test(start_paused = true)]
async fn panic_resolves_as_retry() {
    let mut f = fixture(Scripted::new([Step::Panic]), policy(5), config());
    let id = f
        .backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let requeued = f.backend.peek(QUEUE, id).await.unwrap();
    assert_eq!(requeued.meta.attempt, 2);
    let error = requeued.meta.error.unwrap();
    assert!(error.contains("panicked"), "{error}");
    assert!(error.contains("carrier API exploded"), "{error}");
    assert!(drain(&mut f.events)
        .iter()
        .any(|k| matches!(k, EventKind::RetryScheduled { .. })));
}

#[tokio::test(start_paused = true)]
async fn timeout_cancels_handler_and_retries() {
    let f = fixture(Scripted::new([Step::Hang]), policy(5), config());
    let id = f
        .backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let requeued = f.backend.peek(QUEUE, id).await.unwrap();
    assert_eq!(requeued.meta.attempt, 2);
    assert!(requeued.meta.error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn undecodable_body_is_dead_lettered_raw() {
    let f = fixture(Scripted::new([]), policy(5), config());
    f.backend
        .enqueue_raw(QUEUE, json!({"order_id": 42}))
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let dead = f.backend.dead_letters(QUEUE).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message, json!({"order_id": 42}));
    assert!(dead[0].reason.starts_with("decode error"));
}

#[tokio::test(start_paused = true)]
async fn queue_name_mismatch_is_dead_lettered() {
    let handler = Scripted::new([]);
    let f = fixture(handler.clone(), policy(5), config());
    f.backend
        .enqueue(QUEUE, &Envelope::new(BILLING, json!({})), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    let dead = f.backend.dead_letters(QUEUE).await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("does not match"));
}

#[tokio::test(start_paused = true)]
async fn validation_failure_is_fatal() {
    let f = fixture(Scripted::rejecting(), policy(5), config());
    f.backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let dead = f.backend.dead_letters(QUEUE).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_policy_comes_from_config() {
    let backend = Arc::new(InMemoryBackend::with_queues([QUEUE]));
    let handler: Arc<dyn Handler> = Scripted::new([Step::Retry]);
    let f = fixture_on(
        backend,
        [(QUEUE, handler)],
        None,
        DispatchConfig {
            retry: policy(1),
            ..config()
        },
    );
    f.backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    assert_eq!(f.dispatcher.config().retry.max_attempts, 1);
    let dead = f.backend.dead_letters(QUEUE).await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("exhausted 1/1 attempts"));
}

#[tokio::test(start_paused = true)]
async fn retry_keeps_unknown_meta_fields() {
    let f = fixture(Scripted::new([Step::Retry]), policy(5), config());
    let id = f
        .backend
        .enqueue_raw(
            QUEUE,
            json!({
                "data": {"order_id": 42},
                "meta": {"queue_name": QUEUE, "correlation_queue": "parent_q", "origin": "edi"}
            }),
        )
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let requeued = f.backend.peek(QUEUE, id).await.unwrap();
    assert_eq!(requeued.meta.attempt, 2);
    assert_eq!(requeued.meta.correlation_queue.as_deref(), Some("parent_q"));
    assert_eq!(requeued.meta.extra.get("origin"), Some(&json!("edi")));
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn buffered_message_gets_fresh_lease_before_handling() {
    let handler = Scripted::new([
        Step::Sleep(Duration::from_secs(9)),
        Step::Sleep(Duration::from_secs(9)),
    ]);
    let mut f = fixture(
        handler.clone(),
        policy(5),
        DispatchConfig {
            workers: 1,
            buffer: 1,
            batch_size: 1,
            lease_duration: Duration::from_secs(10),
            handler_timeout: Duration::from_millis(9500),
            max_runtime: Some(Duration::from_secs(30)),
            ..config()
        },
    );
    for n in 0..2 {
        f.backend
            .enqueue(QUEUE, &Envelope::new(QUEUE, json!({"n": n})), Duration::ZERO)
            .await
            .unwrap();
    }

    // The second message waits in the buffer for 9s of its 10s lease.
    let stats = f.dispatcher.run(CancellationToken::new()).await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.lost, 0);
    assert_eq!(f.backend.depth(QUEUE).await, 0);
    assert_eq!(f.backend.archived(QUEUE).await.len(), 2);
    assert!(!drain(&mut f.events)
        .iter()
        .any(|k| matches!(k, EventKind::LeaseLost { .. })));
}

#[tokio::test(start_paused = true)]
async fn long_handler_keeps_message_invisible() {
    let handler = Scripted::new([Step::Sleep(Duration::from_secs(55))]);
    let f = fixture(
        handler.clone(),
        policy(5),
        DispatchConfig {
            lease_duration: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(60),
            extend_leases: true,
            max_messages: Some(1),
            ..config()
        },
    );
    f.backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    let run = {
        let dispatcher = f.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_secs(50)).await;

    // Five lease lengths in, the message is still held.
    assert!(f.backend.lease(QUEUE, 10, LEASE).await.unwrap().is_empty());

    let stats = run.await.unwrap().unwrap();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.lost, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.backend.depth(QUEUE).await, 0);
}

#[tokio::test(start_paused = true)]
async fn lost_lease_is_not_counted() {
    let backend = Arc::new(InMemoryBackend::with_queues([QUEUE]));
    let handler = Overrun::new(backend.clone());
    let mut f = fixture_on(
        backend,
        [(QUEUE, handler.clone() as Arc<dyn Handler>)],
        Some(policy(5)),
        config(),
    );
    f.tracker.note_expected("corr-1", 1).await.unwrap();
    let id = f
        .backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let stats = f.dispatcher.stats();
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.lost, 1);
    assert!(f.backend.peek(QUEUE, id).await.is_some());
    let record = f.tracker.record("corr-1").await.unwrap().unwrap();
    assert_eq!(record.completed_count, 0);
    assert_eq!(record.state, CorrelationState::Open);
    let kinds = drain(&mut f.events);
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::LeaseLost { operation, .. } if operation == "ack"
    )));
    assert!(!kinds.iter().any(|k| matches!(k, EventKind::Acked { .. })));

    // The other consumer's lease runs out; the next delivery counts once.
    tokio::time::advance(LEASE).await;
    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(f.dispatcher.stats().acked, 1);
    let record = f.tracker.record("corr-1").await.unwrap().unwrap();
    assert_eq!(record.completed_count, 1);
    assert_eq!(record.state, CorrelationState::Complete);
}

#[tokio::test(start_paused = true)]
async fn one_dispatcher_serves_two_queues() {
    let backend = Arc::new(InMemoryBackend::with_queues([QUEUE, BILLING]));
    let shipping = Scripted::new([]);
    let billing = Scripted::new([]);
    let f = fixture_on(
        backend,
        [
            (QUEUE, shipping.clone() as Arc<dyn Handler>),
            (BILLING, billing.clone() as Arc<dyn Handler>),
        ],
        Some(policy(5)),
        DispatchConfig {
            queues: vec![QUEUE.to_string(), BILLING.to_string()],
            max_messages: Some(4),
            ..config()
        },
    );
    for queue in [QUEUE, BILLING] {
        for n in 0..2 {
            f.backend
                .enqueue(queue, &Envelope::new(queue, json!({"n": n})), Duration::ZERO)
                .await
                .unwrap();
        }
    }

    let stats = f.dispatcher.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.acked, 4);
    assert_eq!(shipping.calls.load(Ordering::SeqCst), 2);
    assert_eq!(billing.calls.load(Ordering::SeqCst), 2);
    for queue in [QUEUE, BILLING] {
        assert_eq!(f.backend.depth(queue).await, 0);
        assert_eq!(f.backend.archived(queue).await.len(), 2);
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fan_out_completes_with_mixed_outcomes() {
    let mut f = fixture(
        Scripted::new([Step::Ok, Step::Fatal, Step::Ok]),
        policy(5),
        config(),
    );
    f.tracker.note_expected("fan-1", 3).await.unwrap();
    for n in 0..3 {
        let env = Envelope::new(QUEUE, json!({"part": n})).correlation_id("fan-1");
        f.backend.enqueue(QUEUE, &env, Duration::ZERO).await.unwrap();
    }

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    let record = f.tracker.record("fan-1").await.unwrap().unwrap();
    assert_eq!(record.completed_count, 2);
    assert_eq!(record.failed_count, 1);
    assert_eq!(record.state, CorrelationState::Complete);
    assert!(drain(&mut f.events).iter().any(|k| matches!(
        k,
        EventKind::CorrelationTransition {
            to: CorrelationState::Complete,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn correlation_created_lazily_on_lease() {
    let f = fixture(Scripted::new([Step::Retry]), policy(5), config());
    assert_eq!(
        f.tracker.status("corr-1").await.unwrap(),
        CorrelationStatus::Unknown
    );
    f.backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();
    f.dispatcher.dispatch_once(QUEUE).await.unwrap();
    assert_eq!(
        f.tracker.status("corr-1").await.unwrap(),
        CorrelationStatus::Open
    );
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn run_stops_at_message_cap() {
    let f = fixture(
        Scripted::new([]),
        policy(5),
        DispatchConfig {
            workers: 2,
            max_messages: Some(5),
            ..config()
        },
    );
    for n in 0..5 {
        f.backend
            .enqueue(QUEUE, &Envelope::new(QUEUE, json!({"n": n})), Duration::ZERO)
            .await
            .unwrap();
    }

    let stats = f.dispatcher.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.acked, 5);
    assert_eq!(f.backend.depth(QUEUE).await, 0);
}

#[tokio::test(start_paused = true)]
async fn run_stops_at_runtime_cap() {
    let f = fixture(
        Scripted::new([]),
        policy(5),
        DispatchConfig {
            max_runtime: Some(Duration::from_secs(5)),
            ..config()
        },
    );
    let stats = f.dispatcher.run(CancellationToken::new()).await.unwrap();
    assert_eq!(stats.finished, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_stuck_handlers_after_grace() {
    let f = fixture(
        Scripted::new([Step::Stuck]),
        policy(5),
        DispatchConfig {
            lease_duration: Duration::from_secs(7200),
            handler_timeout: Duration::from_secs(7200),
            shutdown_grace: Duration::from_secs(1),
            ..config()
        },
    );
    let id = f
        .backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let run = {
        let dispatcher = f.dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    let stats = run.await.unwrap().unwrap();

    assert_eq!(stats.acked, 0);
    assert_eq!(stats.released, 1);
    // Released, not acked: visible again with its attempt untouched.
    let leased = f.backend.lease(QUEUE, 10, LEASE).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].lease.message_id, id);
    assert_eq!(f.backend.peek(QUEUE, id).await.unwrap().meta.attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn full_pool_pauses_leasing() {
    let f = fixture(
        Scripted::new([Step::Stuck; 10]),
        policy(5),
        DispatchConfig {
            workers: 1,
            buffer: 1,
            batch_size: 10,
            lease_duration: Duration::from_secs(7200),
            handler_timeout: Duration::from_secs(7200),
            shutdown_grace: Duration::from_secs(1),
            ..config()
        },
    );
    for n in 0..10 {
        f.backend
            .enqueue(QUEUE, &Envelope::new(QUEUE, json!({"n": n})), Duration::ZERO)
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let run = {
        let dispatcher = f.dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    // One message in the handler, one waiting in the buffer.
    let still_visible = f.backend.lease(QUEUE, 100, LEASE).await.unwrap();
    assert_eq!(still_visible.len(), 8);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn validate_only_never_resolves() {
    let mut f = fixture(
        Scripted::rejecting(),
        policy(5),
        DispatchConfig {
            mode: DispatchMode::ValidateOnly,
            ..config()
        },
    );
    f.backend
        .enqueue(QUEUE, &order(), Duration::ZERO)
        .await
        .unwrap();

    f.dispatcher.dispatch_once(QUEUE).await.unwrap();

    assert_eq!(f.backend.depth(QUEUE).await, 1);
    assert!(f.backend.dead_letters(QUEUE).await.is_empty());
    assert!(drain(&mut f.events)
        .iter()
        .any(|k| matches!(k, EventKind::ValidationFailed { .. })));
    assert_eq!(f.dispatcher.stats().validated, 1);
}

// ---------------------------------------------------------------------------
// Startup and backend health
// ---------------------------------------------------------------------------

#[test]
fn build_rejects_queue_without_handler() {
    let backend = Arc::new(InMemoryBackend::with_queues([QUEUE]));
    let err = Dispatcher::builder(backend, Arc::new(HandlerRegistry::empty()))
        .config(DispatchConfig::for_queues(["nobody_home"]))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, Error::HandlerNotFound(q) if q == "nobody_home"));
}

#[tokio::test(start_paused = true)]
async fn backend_outage_flips_health_and_recovers() {
    let mut f = fixture(Scripted::new([]), policy(5), config());
    let health = f.dispatcher.health();

    f.backend.inject_failures(2);
    assert!(f.dispatcher.dispatch_once(QUEUE).await.is_err());
    assert!(matches!(*health.borrow(), Health::Unhealthy { .. }));

    assert!(f.dispatcher.dispatch_once(QUEUE).await.is_ok());
    assert_eq!(*health.borrow(), Health::Healthy);

    let kinds = drain(&mut f.events);
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::BackendUnhealthy { .. })));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::BackendRecovered { .. })));
}
