//! Process configuration, read once from the environment at startup.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use redline_backoff::{BackoffConfig, CollectorConfig};
use redline_jobs::{JobRunnerConfig, DEFAULT_LOG_CAPACITY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub bind: SocketAddr,
    pub playbook: Option<PathBuf>,
    pub log_capacity: usize,
    pub collection_interval: Duration,
    pub max_consecutive_failures: u32,
    pub retry_interval: Duration,
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset and empty values take
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let bind = parse(&get, "REDLINE_BIND", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
        let playbook = get("REDLINE_PLAYBOOK").map(PathBuf::from);
        let log_capacity = positive(&get, "JOB_LOG_CAPACITY", DEFAULT_LOG_CAPACITY as u64)?;
        let interval = positive(&get, "COLLECTION_INTERVAL_SECONDS", 20)?;
        let failures = positive(&get, "MAX_CONSECUTIVE_FAILURES", 5)?;
        let retry_minutes = positive(&get, "RETRY_INTERVAL_MINUTES", 5)?;

        Ok(Self {
            bind,
            playbook,
            log_capacity: usize::try_from(log_capacity).unwrap_or(usize::MAX),
            collection_interval: Duration::from_secs(interval),
            max_consecutive_failures: u32::try_from(failures).unwrap_or(u32::MAX),
            retry_interval: Duration::from_secs(retry_minutes.saturating_mul(60)),
        })
    }

    pub fn runner(&self) -> JobRunnerConfig {
        JobRunnerConfig::default().with_log_capacity(self.log_capacity)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig::default()
            .with_threshold(self.max_consecutive_failures)
            .with_pause(self.retry_interval)
    }

    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig::default()
            .with_interval(self.collection_interval)
            .with_backoff(self.backoff())
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match get(var) {
        None => {
            tracing::debug!(var, %default, "using default");
            Ok(default)
        }
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn positive(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = parse(get, var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
