//! Durable work queue abstraction.
//!
//! The pipeline only needs one operation: hand a job message to the queue and
//! get back a correlation id. Delivery to workers is at-least-once; workers
//! report back through `Pipeline::report_job_status`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use narrate_core::{AudioBookId, ChapterId, JobId, JobType, ProcessingJob};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;

/// Message handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub audiobook_id: AudioBookId,
    pub chapter_id: Option<ChapterId>,
    pub job_type: JobType,
    pub payload: Value,
    /// Operator retries so far; lets workers tell redeliveries from retries.
    pub attempt: u32,
}

impl From<&ProcessingJob> for JobMessage {
    fn from(job: &ProcessingJob) -> Self {
        Self {
            job_id: job.id,
            audiobook_id: job.audiobook_id,
            chapter_id: job.chapter_id,
            job_type: job.job_type,
            payload: job.payload.clone(),
            attempt: job.retry_count,
        }
    }
}

/// Queue-assigned id of an enqueued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("enqueue timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: &JobMessage) -> Result<CorrelationId, QueueError>;
}
