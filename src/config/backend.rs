//! Backend adapter settings.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a successful `ack` does with the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Move to the archive table; kept for audit.
    #[default]
    Archive,
    /// Remove permanently.
    Delete,
}

/// pgmq adapter settings.
#[derive(Debug, Clone)]
pub struct PgmqConfig {
    pub dsn: SecretString,
    pub max_connections: u32,
    pub ack_mode: AckMode,
    /// Dead letters for queue `q` go to `q{dead_letter_suffix}`.
    pub dead_letter_suffix: String,
}

impl PgmqConfig {
    pub fn new(dsn: SecretString) -> Self {
        Self {
            dsn,
            max_connections: 10,
            ack_mode: AckMode::Archive,
            dead_letter_suffix: "_dlq".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.dead_letter_suffix.is_empty() {
            return Err(Error::Config(
                "dead_letter_suffix must not be empty: dead letters would land in the source queue"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn dead_letter_queue(&self, queue_name: &str) -> String {
        format!("{queue_name}{}", self.dead_letter_suffix)
    }
}

/// Queue creation options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Create a partitioned queue (requires pg_partman).
    pub partition: Option<PartitionOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub partition_interval: i64,
    pub retention_interval: i64,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            partition_interval: 1000,
            retention_interval: 1_000_000,
        }
    }
}

impl QueueOptions {
    pub fn partitioned(options: PartitionOptions) -> Self {
        Self {
            partition: Some(options),
        }
    }
}
