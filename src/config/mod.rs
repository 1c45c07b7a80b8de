//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use crate::engine::ControlConfig;
use crate::error::{Error, Result};
use crate::reconcile::ReconcileConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub worker_url: String,
    pub worker_timeout: Duration,
    pub pool_size: usize,
    pub queue_name: String,
    pub visibility_timeout_secs: i32,
    pub retry_delay: Duration,
    pub max_deliveries: u32,
    pub require_shot_images: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            worker_url: required_var("WORKER_URL")?,
            worker_timeout: Duration::from_secs(parsed_var("WORKER_TIMEOUT_SECS", 300)?),
            pool_size: parsed_var("POOL_SIZE", 10)?,
            queue_name: std::env::var("QUEUE_NAME").unwrap_or_else(|_| "story_tasks".to_string()),
            visibility_timeout_secs: parsed_var("VISIBILITY_TIMEOUT_SECS", 600)?,
            retry_delay: Duration::from_secs(parsed_var("RETRY_DELAY_SECS", 30)?),
            max_deliveries: parsed_var("MAX_DELIVERIES", 5)?,
            require_shot_images: parsed_var("REQUIRE_SHOT_IMAGES", false)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("POOL_SIZE must be at least 1".to_string()));
        }
        if self.max_deliveries == 0 {
            return Err(Error::Config("MAX_DELIVERIES must be at least 1".to_string()));
        }
        // A message must not reappear while its worker call is still running.
        if (self.visibility_timeout_secs.max(0) as u64) <= self.worker_timeout.as_secs() {
            return Err(Error::Config(format!(
                "VISIBILITY_TIMEOUT_SECS ({}) must exceed WORKER_TIMEOUT_SECS ({})",
                self.visibility_timeout_secs,
                self.worker_timeout.as_secs()
            )));
        }
        Ok(())
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            pool_size: self.pool_size,
            retry_delay: self.retry_delay,
            max_deliveries: self.max_deliveries,
            ..ControlConfig::default()
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            require_images: self.require_shot_images,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ('{raw}'): {e}"))),
        Err(_) => Ok(default),
    }
}
