//! Dispatcher settings.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// What the dispatcher does with leased messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Validate, handle, resolve.
    #[default]
    Process,
    /// Validate only and release every lease unresolved.
    ValidateOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Queues to consume. Every one needs a registered handler.
    pub queues: Vec<String>,
    /// Concurrent handler invocations.
    pub workers: usize,
    /// Most messages leased per backend call.
    pub batch_size: usize,
    /// Capacity of the bounded work queue between lease loops and workers.
    pub buffer: usize,
    /// Sleep between lease calls that returned nothing.
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub handler_timeout: Duration,
    /// Extend leases every `lease_duration / 2` while a handler runs.
    pub extend_leases: bool,
    /// How long in-flight handlers may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Stop after this many messages have been resolved.
    pub max_messages: Option<u64>,
    /// Stop after this much wall time.
    pub max_runtime: Option<Duration>,
    pub mode: DispatchMode,
    /// Backoff and attempt ceiling for failed messages.
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            workers: 4,
            batch_size: 10,
            buffer: 16,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(240),
            extend_leases: false,
            shutdown_grace: Duration::from_secs(30),
            max_messages: None,
            max_runtime: None,
            mode: DispatchMode::Process,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn for_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(Error::Config("at least one queue is required".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.buffer == 0 {
            return Err(Error::Config("buffer must be at least 1".into()));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::Config("lease_duration must be positive".into()));
        }
        if self.handler_timeout > self.lease_duration && !self.extend_leases {
            return Err(Error::Config(format!(
                "handler_timeout ({:?}) exceeds lease_duration ({:?}); enable extend_leases or shorten the timeout",
                self.handler_timeout, self.lease_duration
            )));
        }
        self.retry.validate()
    }

    /// Load the `[dispatch]` table of a TOML file. Durations are in seconds;
    /// missing fields keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        struct File {
            #[serde(default)]
            dispatch: Option<DispatchFile>,
        }

        let file: File = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        let config = file.dispatch.unwrap_or_default().into_config();
        config.validate()?;
        Ok(config)
    }
}

/// On-disk shape of `[dispatch]`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatchFile {
    queues: Option<Vec<String>>,
    workers: Option<usize>,
    batch_size: Option<usize>,
    buffer: Option<usize>,
    poll_interval_secs: Option<f64>,
    lease_duration_secs: Option<u64>,
    handler_timeout_secs: Option<u64>,
    extend_leases: Option<bool>,
    shutdown_grace_secs: Option<u64>,
    max_messages: Option<u64>,
    max_runtime_secs: Option<u64>,
    mode: Option<DispatchMode>,
    retry_base_delay_secs: Option<f64>,
    retry_max_delay_secs: Option<f64>,
    max_attempts: Option<u32>,
    retry_jitter: Option<f64>,
}

fn secs_f64(secs: Option<f64>, default: Duration) -> Duration {
    secs.and_then(|s| Duration::try_from_secs_f64(s).ok())
        .unwrap_or(default)
}

impl DispatchFile {
    fn into_config(self) -> DispatchConfig {
        let d = DispatchConfig::default();
        DispatchConfig {
            queues: self.queues.unwrap_or(d.queues),
            workers: self.workers.unwrap_or(d.workers),
            batch_size: self.batch_size.unwrap_or(d.batch_size),
            buffer: self.buffer.unwrap_or(d.buffer),
            poll_interval: secs_f64(self.poll_interval_secs, d.poll_interval),
            lease_duration: self
                .lease_duration_secs
                .map_or(d.lease_duration, Duration::from_secs),
            handler_timeout: self
                .handler_timeout_secs
                .map_or(d.handler_timeout, Duration::from_secs),
            extend_leases: self.extend_leases.unwrap_or(d.extend_leases),
            shutdown_grace: self
                .shutdown_grace_secs
                .map_or(d.shutdown_grace, Duration::from_secs),
            max_messages: self.max_messages,
            max_runtime: self.max_runtime_secs.map(Duration::from_secs),
            mode: self.mode.unwrap_or(d.mode),
            retry: RetryPolicy {
                base_delay: secs_f64(self.retry_base_delay_secs, d.retry.base_delay),
                max_delay: secs_f64(self.retry_max_delay_secs, d.retry.max_delay),
                max_attempts: self.max_attempts.unwrap_or(d.retry.max_attempts),
                jitter: self.retry_jitter.unwrap_or(d.retry.jitter),
            },
        }
    }
}
