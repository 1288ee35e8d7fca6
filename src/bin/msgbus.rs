//! msgbus CLI: run dispatchers, produce messages, administer queues.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use msgbus_rs::backend::{QueueAdmin, QueueBackend};
use msgbus_rs::config::backend::PartitionOptions;
use msgbus_rs::config::{AckMode, Config, DispatchConfig, DispatchMode, QueueOptions};
use msgbus_rs::correlation::{CorrelationConfig, CorrelationTracker};
use msgbus_rs::db::Db;
use msgbus_rs::engine::Dispatcher;
use msgbus_rs::handlers::register_builtin;
use msgbus_rs::producer::{EnqueueOptions, Producer};
use msgbus_rs::registry::HandlerRegistry;
use msgbus_rs::telemetry::{TelemetryConfig, init_telemetry};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "msgbus", about = "Postgres message bus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume queues with the registered handlers
    Process(ProcessArgs),
    /// Enqueue one message
    Enqueue {
        queue: String,
        /// JSON payload for `data`
        data: String,
        #[arg(long)]
        correlation_id: Option<String>,
        #[arg(long)]
        target_id: Option<String>,
        /// Integer or tag
        #[arg(long)]
        version: Option<String>,
        /// Delay in seconds before the message becomes visible
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Queue administration
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Fan-out tracking
    Correlation {
        #[command(subcommand)]
        action: CorrelationAction,
    },
}

#[derive(clap::Args)]
struct ProcessArgs {
    /// Queues to consume (default: every queue with a handler)
    #[arg(long, num_args = 1..)]
    queue_names: Vec<String>,
    /// TOML file with a [dispatch] table; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Seconds between empty polls
    #[arg(long)]
    poll_interval: Option<f64>,
    /// Lease duration in seconds
    #[arg(long)]
    visibility_timeout: Option<u64>,
    /// Per-message handler timeout in seconds
    #[arg(long)]
    handler_timeout: Option<u64>,
    /// Seconds before the first retry of a failed message; later retries double it
    #[arg(long, visible_alias = "retry-base-delay")]
    error_visibility_timeout: Option<f64>,
    /// Ceiling on the retry delay in seconds
    #[arg(long)]
    retry_max_delay: Option<f64>,
    /// Delivery attempts before a retryable failure is dead-lettered
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Random extra delay as a fraction of the backoff, in [0, 1]
    #[arg(long)]
    retry_jitter: Option<f64>,
    /// Stop after this many messages (0 = no cap)
    #[arg(long, default_value_t = 100)]
    max_messages: u64,
    /// Stop after this many seconds (0 = no cap)
    #[arg(long, default_value_t = 600)]
    max_runtime: u64,
    /// Only validate messages; never ack, retry or dead-letter
    #[arg(long)]
    validate_only: bool,
    /// Delete acked messages instead of archiving them
    #[arg(long)]
    delete_messages: bool,
    /// Extend leases while handlers run
    #[arg(long)]
    extend_leases: bool,
    /// One dead-lettered message fails its whole correlation
    #[arg(long)]
    fail_fast: bool,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create a queue and its dead-letter queue
    Create {
        name: String,
        /// Partitioned queue (requires pg_partman)
        #[arg(long)]
        partition: bool,
    },
    /// Show depth and age metrics
    Status { name: String },
    /// Drop a queue and all its messages
    Destroy { name: String },
    /// Delete every message in a queue
    Purge { name: String },
    /// List queues
    List,
}

#[derive(Subcommand)]
enum CorrelationAction {
    /// Show the state of a correlation id
    Status { id: String },
    /// Declare how many messages a correlation fans out into
    Expect { id: String, count: u32 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Process(args) => cmd_process(&config, args).await,
        Command::Enqueue {
            queue,
            data,
            correlation_id,
            target_id,
            version,
            delay,
        } => {
            let db = connect(&config, AckMode::Archive).await?;
            db.create_queue(&queue, &QueueOptions::default()).await?;
            let tracker = CorrelationTracker::new(
                Arc::new(db.correlation_store()),
                CorrelationConfig::default(),
            );
            let producer = Producer::new(db as Arc<dyn QueueBackend>).with_tracker(tracker);

            let mut options = EnqueueOptions::default().delay(Duration::from_secs(delay));
            options.correlation_id = correlation_id;
            options.target_id = target_id;
            options.version = version.map(|v| match v.parse::<u64>() {
                Ok(n) => n.into(),
                Err(_) => v.as_str().into(),
            });

            let id = producer
                .enqueue(&queue, serde_json::from_str(&data)?, options)
                .await?;
            println!("Enqueued: {queue} #{id}");
            Ok(())
        }
        Command::Queue { action } => {
            let db = connect(&config, AckMode::Archive).await?;
            cmd_queue(&db, action).await
        }
        Command::Correlation { action } => {
            let db = connect(&config, AckMode::Archive).await?;
            let tracker = CorrelationTracker::new(
                Arc::new(db.correlation_store()),
                CorrelationConfig::default(),
            );
            match action {
                CorrelationAction::Status { id } => match tracker.record(&id).await? {
                    Some(record) => {
                        println!("ID:         {}", record.correlation_id);
                        println!("State:      {}", record.state);
                        println!(
                            "Expected:   {}",
                            record
                                .expected_count
                                .map_or("-".to_string(), |n| n.to_string())
                        );
                        println!("Completed:  {}", record.completed_count);
                        println!("Failed:     {}", record.failed_count);
                        println!("Updated:    {}", record.updated_at);
                    }
                    None => println!("{id}: UNKNOWN"),
                },
                CorrelationAction::Expect { id, count } => {
                    let transition = tracker.note_expected(&id, count).await?;
                    println!("{id}: {transition:?}");
                }
            }
            Ok(())
        }
    }
}

async fn connect(config: &Config, ack_mode: AckMode) -> anyhow::Result<Arc<Db>> {
    let mut pgmq = config.pgmq();
    pgmq.ack_mode = ack_mode;
    let db = Db::connect(pgmq).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

async fn cmd_process(config: &Config, args: ProcessArgs) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(config, "msgbus"))?;

    let mut registry = HandlerRegistry::empty();
    register_builtin(&mut registry)?;

    let mut dispatch = match &args.config {
        Some(path) => DispatchConfig::from_toml_file(path)?,
        None => DispatchConfig::default(),
    };
    if !args.queue_names.is_empty() {
        dispatch.queues = args.queue_names.clone();
    }
    if let Some(workers) = args.workers {
        dispatch.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        dispatch.batch_size = batch_size;
    }
    if let Some(secs) = args.poll_interval {
        dispatch.poll_interval = Duration::try_from_secs_f64(secs)?;
    }
    if let Some(secs) = args.visibility_timeout {
        dispatch.lease_duration = Duration::from_secs(secs);
        dispatch.handler_timeout = dispatch.handler_timeout.min(dispatch.lease_duration);
    }
    if let Some(secs) = args.handler_timeout {
        dispatch.handler_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.error_visibility_timeout {
        dispatch.retry.base_delay = Duration::try_from_secs_f64(secs)?;
        dispatch.retry.max_delay = dispatch.retry.max_delay.max(dispatch.retry.base_delay);
    }
    if let Some(secs) = args.retry_max_delay {
        dispatch.retry.max_delay = Duration::try_from_secs_f64(secs)?;
    }
    if let Some(max_attempts) = args.max_attempts {
        dispatch.retry.max_attempts = max_attempts;
    }
    if let Some(jitter) = args.retry_jitter {
        dispatch.retry.jitter = jitter;
    }
    dispatch.max_messages = (args.max_messages > 0).then_some(args.max_messages);
    dispatch.max_runtime = (args.max_runtime > 0).then(|| Duration::from_secs(args.max_runtime));
    dispatch.extend_leases |= args.extend_leases;
    if args.validate_only {
        dispatch.mode = DispatchMode::ValidateOnly;
    }

    let ack_mode = if args.delete_messages {
        AckMode::Delete
    } else {
        AckMode::Archive
    };
    let db = connect(config, ack_mode).await?;

    let queues = if dispatch.queues.is_empty() {
        registry.queue_names()
    } else {
        dispatch.queues.clone()
    };
    for queue in &queues {
        db.create_queue(queue, &QueueOptions::default()).await?;
    }

    let tracker = CorrelationTracker::new(
        Arc::new(db.correlation_store()),
        CorrelationConfig {
            fail_fast: args.fail_fast,
        },
    );
    let dispatcher = Dispatcher::builder(db, Arc::new(registry))
        .config(dispatch)
        .tracker(tracker)
        .build()?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        on_signal.cancel();
    });

    let stats = dispatcher.run(shutdown).await?;
    println!(
        "acked {} | retried {} | dead-lettered {} | released {} | validated {} | lost {}",
        stats.acked,
        stats.retried,
        stats.dead_lettered,
        stats.released,
        stats.validated,
        stats.lost
    );
    Ok(())
}

async fn cmd_queue(db: &Db, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Create { name, partition } => {
            let options = if partition {
                QueueOptions::partitioned(PartitionOptions::default())
            } else {
                QueueOptions::default()
            };
            db.create_queue(&name, &options).await?;
            db.create_queue(&db.config().dead_letter_queue(&name), &options)
                .await?;
            println!("Created: {name}");
        }
        QueueAction::Status { name } => {
            let m = db.metrics(&name).await?;
            let age = |a: Option<i32>| a.map_or("-".to_string(), |s| format!("{s}s"));
            println!("Queue:      {}", m.queue_name);
            println!("Length:     {}", m.queue_length);
            println!("Newest:     {}", age(m.newest_msg_age_sec));
            println!("Oldest:     {}", age(m.oldest_msg_age_sec));
            println!("Total:      {}", m.total_messages);
            println!("Scraped:    {}", m.scrape_time);
        }
        QueueAction::Destroy { name } => {
            if db.drop_queue(&name).await? {
                println!("Dropped: {name}");
            } else {
                println!("No such queue: {name}");
            }
        }
        QueueAction::Purge { name } => {
            let n = db.purge_queue(&name).await?;
            println!("Purged {n} message(s) from {name}");
        }
        QueueAction::List => {
            let queues = db.list_queues().await?;
            if queues.is_empty() {
                println!("No queues found.");
            }
            for q in &queues {
                println!("{q}");
            }
        }
    }
    Ok(())
}
