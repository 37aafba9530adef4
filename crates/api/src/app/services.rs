use std::sync::Arc;

use anyhow::Context;

use narrate_infra::{
    Pipeline, PipelineConfig,
    queue::{InMemoryJobQueue, JobQueue, RedisStreamsJobQueue},
    store::{InMemoryStore, PipelineStore, PostgresStore},
};

use crate::config::ApiConfig;

/// Shared state behind every handler.
pub struct AppServices {
    pub pipeline: Pipeline,
}

impl AppServices {
    pub fn new(store: Arc<dyn PipelineStore>, queue: Arc<dyn JobQueue>, config: PipelineConfig) -> Self {
        Self {
            pipeline: Pipeline::new(store, queue, config),
        }
    }

    /// In-memory store and queue (dev/test).
    pub fn in_memory(config: PipelineConfig) -> Self {
        Self::new(InMemoryStore::arc(), InMemoryJobQueue::arc(), config)
    }
}

pub async fn build_services(config: &ApiConfig) -> anyhow::Result<AppServices> {
    if !config.use_persistent_stores {
        tracing::info!("using in-memory store and queue");
        return Ok(AppServices::in_memory(config.pipeline.clone()));
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let store = PostgresStore::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    store.migrate().await.context("failed to apply schema")?;

    let queue = RedisStreamsJobQueue::new(&config.redis_url, Some(config.queue_prefix.clone()))
        .context("failed to create Redis queue client")?;

    tracing::info!(redis_url = %config.redis_url, prefix = %config.queue_prefix, "using Postgres store and Redis Streams queue");
    Ok(AppServices::new(
        Arc::new(store),
        Arc::new(queue),
        config.pipeline.clone(),
    ))
}
