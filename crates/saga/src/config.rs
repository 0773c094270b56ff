//! Executor configuration with environment overrides.

use std::str::FromStr;
use std::time::Duration;

use crate::compensation::UnwindPolicy;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// What to do with a submission when `max_concurrent` executions are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Keep the execution Pending until a slot frees up.
    #[default]
    Queue,
    /// Fail the submission immediately.
    Reject,
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(AdmissionPolicy::Queue),
            "reject" => Ok(AdmissionPolicy::Reject),
            _ => Err("expected 'queue' or 'reject'".to_string()),
        }
    }
}

/// Executor settings.
///
/// Reads from environment variables:
/// - `SAGA_MAX_CONCURRENT` — executions running at once (default: `64`)
/// - `SAGA_ADMISSION` — `queue` or `reject` beyond the limit (default: `queue`)
/// - `SAGA_MAX_ATTEMPTS` — forward attempts per step (default: `3`)
/// - `SAGA_BASE_BACKOFF_MS` — first retry delay (default: `100`)
/// - `SAGA_MAX_BACKOFF_MS` — retry delay cap (default: `10000`)
/// - `SAGA_JITTER_MS` — jitter bound added to each delay (default: `50`)
/// - `SAGA_COMPENSATION_MAX_ATTEMPTS` — attempts per compensation (default: `5`)
/// - `SAGA_ATTEMPT_TIMEOUT_MS` — per-attempt timeout, `0` disables (default: `30000`)
/// - `SAGA_UNWIND` — `continue` or `abort` after a failed compensation (default: `continue`)
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent: usize,
    pub admission: AdmissionPolicy,
    /// Forward policy for steps without an override.
    pub retry: RetryPolicy,
    /// Compensation policy for steps without an override.
    pub compensation_retry: RetryPolicy,
    pub attempt_timeout: Option<Duration>,
    pub unwind: UnwindPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            admission: AdmissionPolicy::Queue,
            retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::new(5),
            attempt_timeout: Some(Duration::from_secs(30)),
            unwind: UnwindPolicy::Continue,
        }
    }
}

impl ExecutorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Missing keys keep their default; present keys must parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse(&lookup, "SAGA_MAX_CONCURRENT")? {
            config.max_concurrent = n;
        }
        if let Some(admission) = parse(&lookup, "SAGA_ADMISSION")? {
            config.admission = admission;
        }
        if let Some(n) = parse(&lookup, "SAGA_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse(&lookup, "SAGA_BASE_BACKOFF_MS")? {
            config.retry.base_backoff = Duration::from_millis(ms);
            config.compensation_retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "SAGA_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = Duration::from_millis(ms);
            config.compensation_retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "SAGA_JITTER_MS")? {
            config.retry.jitter = Duration::from_millis(ms);
            config.compensation_retry.jitter = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "SAGA_COMPENSATION_MAX_ATTEMPTS")? {
            config.compensation_retry.max_attempts = n;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SAGA_ATTEMPT_TIMEOUT_MS")? {
            config.attempt_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(unwind) = parse(&lookup, "SAGA_UNWIND")? {
            config.unwind = unwind;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the settings an executor cannot run with.
    ///
    /// A zero concurrency limit would queue every execution forever, and a
    /// policy with zero attempts would never invoke a step.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(invalid("SAGA_MAX_CONCURRENT", "0", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("SAGA_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.compensation_retry.max_attempts == 0 {
            return Err(invalid(
                "SAGA_COMPENSATION_MAX_ATTEMPTS",
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
