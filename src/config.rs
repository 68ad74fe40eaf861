use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_BROKER_URL: &str = "amqp://rabbitmq:5672";
pub const DEFAULT_QUEUE: &str = "task_created";
pub const TASK_SERVICE_PORT: u16 = 3002;
pub const NOTIFICATION_SERVICE_PORT: u16 = 3003;

/// Settings shared by both services, read from the environment.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayConfig {
    pub broker_url: String,
    pub queue: String,
    pub prefetch: u16,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub publish_timeout: Duration,
    pub process_timeout: Duration,
    pub shutdown_grace: Duration,
    pub dead_letter_queue: Option<String>,
    pub notification_capacity: usize,
    pub database_path: String,
    pub port: u16,
}

impl RelayConfig {
    pub fn from_env(default_port: u16) -> Result<Self, ConfigError> {
        Self::from_lookup(default_port, |key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't touch
    /// the process environment.
    pub fn from_lookup<F>(default_port: u16, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let config = Self {
            broker_url: text("RABBITMQ_URL", DEFAULT_BROKER_URL),
            queue: text("QUEUE_NAME", DEFAULT_QUEUE),
            prefetch: number(&lookup, "PREFETCH_COUNT", 1)?,
            retry_count: number(&lookup, "BROKER_RETRY_COUNT", 5)?,
            retry_delay: millis(&lookup, "BROKER_RETRY_DELAY_MS", 5_000)?,
            publish_timeout: millis(&lookup, "PUBLISH_TIMEOUT_MS", 5_000)?,
            process_timeout: millis(&lookup, "PROCESS_TIMEOUT_MS", 30_000)?,
            shutdown_grace: millis(&lookup, "SHUTDOWN_GRACE_MS", 5_000)?,
            dead_letter_queue: lookup("DEAD_LETTER_QUEUE").filter(|v| !v.trim().is_empty()),
            notification_capacity: number(&lookup, "NOTIFICATION_CAPACITY", 100)?,
            database_path: text("DATABASE_PATH", "tasks.db"),
            port: number(&lookup, "PORT", default_port)?,
        };

        positive("PREFETCH_COUNT", config.prefetch as u64)?;
        positive("BROKER_RETRY_COUNT", config.retry_count as u64)?;
        positive("NOTIFICATION_CAPACITY", config.notification_capacity as u64)?;
        Ok(config)
    }
}

fn number<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    number(lookup, key, default).map(Duration::from_millis)
}

fn positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
