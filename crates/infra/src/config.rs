//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use narrate_core::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables shared by the orchestration components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on a single enqueue call.
    pub queue_timeout: Duration,
    /// Call-site retries of transient store errors.
    pub store_retry: BackoffPolicy,
    /// `max_retries` for new uploaded files.
    pub max_file_retries: u32,
    /// `max_retries` for new processing jobs.
    pub max_job_retries: u32,
    /// Minimum age of an undispatched job before the reconciler picks it up.
    pub reconcile_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(5),
            store_retry: BackoffPolicy::default(),
            max_file_retries: 3,
            max_job_retries: 3,
            reconcile_after: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `NARRATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(ms) = parse(&lookup, "NARRATE_QUEUE_TIMEOUT_MS")? {
            config.queue_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "NARRATE_MAX_FILE_RETRIES")? {
            config.max_file_retries = n;
        }
        if let Some(n) = parse(&lookup, "NARRATE_MAX_JOB_RETRIES")? {
            config.max_job_retries = n;
        }
        if let Some(secs) = parse(&lookup, "NARRATE_RECONCILE_AFTER_SECS")? {
            config.reconcile_after = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
