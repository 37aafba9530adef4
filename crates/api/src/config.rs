//! Process configuration read from the environment.

use std::net::SocketAddr;

use anyhow::{Context, bail};

use narrate_infra::PipelineConfig;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Postgres + Redis instead of the in-memory store and queue.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub queue_prefix: String,
    pub pipeline: PipelineConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            queue_prefix: "narrate".to_string(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("NARRATE_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .with_context(|| format!("NARRATE_BIND_ADDR={addr} is not a socket address"))?;
        }
        if let Some(flag) = lookup("USE_PERSISTENT_STORES") {
            config.use_persistent_stores = flag.trim().parse::<bool>().unwrap_or(false);
        }
        config.database_url = lookup("DATABASE_URL");
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(prefix) = lookup("NARRATE_QUEUE_PREFIX") {
            config.queue_prefix = prefix;
        }
        config.pipeline = PipelineConfig::from_lookup(&lookup)?;

        if config.use_persistent_stores && config.database_url.is_none() {
            bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_in_memory_on_8080() {
        let config = ApiConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.use_persistent_stores);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.queue_prefix, "narrate");
    }

    #[test]
    fn persistent_mode_needs_a_database() {
        let err = ApiConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let config = ApiConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/narrate"),
            ("NARRATE_MAX_JOB_RETRIES", "5"),
        ]))
        .unwrap();
        assert!(config.use_persistent_stores);
        assert_eq!(config.pipeline.max_job_retries, 5);
    }

    #[test]
    fn rejects_bad_bind_address() {
        assert!(ApiConfig::from_lookup(lookup(&[("NARRATE_BIND_ADDR", "nowhere")])).is_err());
    }
}
