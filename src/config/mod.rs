//! Process configuration.
//!
//! Connection settings come from the environment (the DSN is held as a
//! `SecretString`); dispatcher tuning can also come from a TOML file.

pub mod backend;
pub mod dispatch;

pub use backend::{AckMode, PgmqConfig, QueueOptions};
pub use dispatch::{DispatchConfig, DispatchMode};

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `PGMQ_DSN` wins over `DATABASE_URL` when both are set.
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("PGMQ_DSN")
            .or_else(|_| required_var("DATABASE_URL"))
            .map_err(|_| {
                Error::Config(
                    "neither PGMQ_DSN nor DATABASE_URL environment variable is set".to_string(),
                )
            })?;
        Ok(Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Backend settings for this environment, with adapter defaults.
    pub fn pgmq(&self) -> PgmqConfig {
        PgmqConfig::new(self.database_url.clone())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
