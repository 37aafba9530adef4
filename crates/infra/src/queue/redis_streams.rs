//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `<prefix>:jobs:<job_type>`, one stream per job type so
//!   each worker pool reads only the work it can do.
//! - **Correlation id**: the entry id assigned by `XADD`.
//! - Consumer groups, acknowledgement and redelivery are the workers' side.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use narrate_core::JobType;

use super::{CorrelationId, JobMessage, JobQueue, QueueError};

/// Default stream key prefix.
const DEFAULT_PREFIX: &str = "narrate";

#[derive(Debug, Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisStreamsJobQueue {
    /// Create a queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - stream key prefix (default: "narrate")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        })
    }

    pub fn stream_key(&self, job_type: JobType) -> String {
        format!("{}:jobs:{}", self.prefix, job_type)
    }
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(
        skip(self, message),
        fields(job_id = %message.job_id, job_type = %message.job_type),
        err
    )]
    async fn enqueue(&self, message: &JobMessage) -> Result<CorrelationId, QueueError> {
        let payload = serde_json::to_string(&message.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let stream_key = self.stream_key(message.job_type);
        let chapter_id = message
            .chapter_id
            .map(|id| id.to_string())
            .unwrap_or_default();

        let entry_id: String = redis::cmd("XADD")
            .arg(&stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("audiobook_id")
            .arg(message.audiobook_id.to_string())
            .arg("chapter_id")
            .arg(chapter_id)
            .arg("job_type")
            .arg(message.job_type.as_str())
            .arg("attempt")
            .arg(message.attempt.to_string())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))?;

        debug!(stream_key = %stream_key, entry_id = %entry_id, "job message appended");
        Ok(CorrelationId(entry_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_is_per_job_type() {
        let queue = RedisStreamsJobQueue::new("redis://localhost:6379", None).unwrap();
        assert_eq!(queue.stream_key(JobType::Transcribe), "narrate:jobs:transcribe");
        let queue =
            RedisStreamsJobQueue::new("redis://localhost:6379", Some("staging".into())).unwrap();
        assert_eq!(queue.stream_key(JobType::Summarize), "staging:jobs:summarize");
    }
}
