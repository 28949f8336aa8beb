//! Scheduler configuration.
//!
//! Every setting has a default; `from_env` overrides from `TASKFORGE_*`
//! variables and rejects malformed values instead of silently ignoring them.

use std::time::Duration;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub const MAX_JOBS_ENV: &str = "TASKFORGE_MAX_JOBS";
pub const POLL_INTERVAL_ENV: &str = "TASKFORGE_POLL_INTERVAL_MS";
pub const BACKOFF_BASE_ENV: &str = "TASKFORGE_BACKOFF_BASE_MS";
pub const JOB_TIMEOUT_ENV: &str = "TASKFORGE_JOB_TIMEOUT_MS";
pub const MAX_ATTEMPTS_ENV: &str = "TASKFORGE_MAX_ATTEMPTS";
pub const SWEEP_INTERVAL_ENV: &str = "TASKFORGE_SWEEP_INTERVAL_SECS";
pub const RETENTION_ENV: &str = "TASKFORGE_RETENTION_SECS";
pub const TRIGGERS_ENV: &str = "TASKFORGE_TRIGGERS";

/// Scheduler and worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Capacity of the live job collection.
    pub max_jobs: usize,
    /// Sleep between readiness checks while only future jobs are queued.
    pub poll_interval: Duration,
    /// Backoff unit: a retry waits `2^attempts × backoff_base`.
    pub backoff_base: Duration,
    /// Per-attempt timeout when a job does not set its own.
    pub default_job_timeout: Duration,
    /// Attempts per job when a job does not set its own.
    pub default_max_attempts: u32,
    /// Retention sweep period.
    pub sweep_interval: Duration,
    /// Jobs older than this are purged by the sweep.
    pub retention: Duration,
    /// Whether the worker starts the periodic trigger rules.
    pub triggers_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 50,
            poll_interval: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            default_job_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
            sweep_interval: Duration::from_secs(60),
            retention: Duration::from_secs(60 * 60),
            triggers_enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, sweep_interval: Duration, retention: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self.retention = retention;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for variable access (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse::<usize>(&lookup, MAX_JOBS_ENV)? {
            config.max_jobs = v;
        }
        if let Some(v) = parse::<u64>(&lookup, POLL_INTERVAL_ENV)? {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, BACKOFF_BASE_ENV)? {
            config.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, JOB_TIMEOUT_ENV)? {
            config.default_job_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u32>(&lookup, MAX_ATTEMPTS_ENV)? {
            config.default_max_attempts = v;
        }
        if let Some(v) = parse::<u64>(&lookup, SWEEP_INTERVAL_ENV)? {
            config.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, RETENTION_ENV)? {
            config.retention = Duration::from_secs(v);
        }
        if let Some(raw) = lookup(TRIGGERS_ENV) {
            config.triggers_enabled = parse_switch(TRIGGERS_ENV, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs == 0 {
            return Err(ConfigError::Zero("max_jobs"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.default_job_timeout.is_zero() {
            return Err(ConfigError::Zero("default_job_timeout"));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Zero("default_max_attempts"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero("sweep_interval"));
        }
        if self.retention.is_zero() {
            return Err(ConfigError::Zero("retention"));
        }
        Ok(())
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_switch(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected on/off".to_string(),
        }),
    }
}
