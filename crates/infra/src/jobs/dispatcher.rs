//! Work Dispatcher: durable job record first, queue hand-off second.
//!
//! The stored job is the source of truth. A queue failure or timeout leaves
//! the job `pending` with no correlation id and is reported as degraded, never
//! as an error. The reconciler picks such jobs up later.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use narrate_core::{AudioBookId, BackoffPolicy, ChapterId, JobId, JobType, ProcessingJob};

use crate::error::PipelineResult;
use crate::queue::{CorrelationId, JobMessage, JobQueue, QueueError};
use crate::retry::with_store_retry;
use crate::store::{PipelineStore, StoreError};

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub job_id: JobId,
    pub correlation_id: Option<CorrelationId>,
    /// Recorded but not handed to the queue.
    pub degraded: bool,
}

pub struct WorkDispatcher {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    retry: BackoffPolicy,
    queue_timeout: Duration,
    max_job_retries: u32,
}

impl WorkDispatcher {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        retry: BackoffPolicy,
        queue_timeout: Duration,
        max_job_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            retry,
            queue_timeout,
            max_job_retries,
        }
    }

    /// Record a `pending` job, then try to enqueue it.
    ///
    /// Fails only if the job could not be recorded.
    #[instrument(skip(self, payload), fields(%audiobook_id, ?chapter_id, %job_type), err)]
    pub async fn create_and_dispatch(
        &self,
        audiobook_id: AudioBookId,
        chapter_id: Option<ChapterId>,
        job_type: JobType,
        payload: Value,
    ) -> PipelineResult<DispatchOutcome> {
        let job = self.prepare(audiobook_id, chapter_id, job_type, payload)?;
        self.record(&job).await?;
        Ok(self.dispatch(&job).await)
    }

    /// Like `create_and_dispatch` for a work-level job, but a job of the same
    /// type already recorded for the audiobook yields `Ok(None)`.
    #[instrument(skip(self, payload), fields(%audiobook_id, %job_type), err)]
    pub async fn create_work_level_once(
        &self,
        audiobook_id: AudioBookId,
        job_type: JobType,
        payload: Value,
    ) -> PipelineResult<Option<DispatchOutcome>> {
        let job = self.prepare(audiobook_id, None, job_type, payload)?;
        match self.record(&job).await {
            Ok(()) => Ok(Some(self.dispatch(&job).await)),
            Err(StoreError::Duplicate(_)) => {
                debug!(%audiobook_id, %job_type, "work-level job already exists");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Enqueue an already-recorded job that has no correlation id.
    pub async fn dispatch_existing(&self, job: &ProcessingJob) -> DispatchOutcome {
        if !job.is_undispatched() {
            return DispatchOutcome {
                job_id: job.id,
                correlation_id: job.correlation_id.clone().map(CorrelationId),
                degraded: false,
            };
        }
        self.dispatch(job).await
    }

    /// Build a `pending` job with this dispatcher's retry limit, without
    /// recording it.
    pub fn prepare(
        &self,
        audiobook_id: AudioBookId,
        chapter_id: Option<ChapterId>,
        job_type: JobType,
        payload: Value,
    ) -> PipelineResult<ProcessingJob> {
        Ok(ProcessingJob::new(
            audiobook_id,
            chapter_id,
            job_type,
            payload,
            self.max_job_retries,
        )?)
    }

    async fn record(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        with_store_retry(&self.retry, "insert_job", || self.store.insert_job(job)).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job recorded");
        Ok(())
    }

    async fn dispatch(&self, job: &ProcessingJob) -> DispatchOutcome {
        let message = JobMessage::from(job);
        let enqueued = match tokio::time::timeout(self.queue_timeout, self.queue.enqueue(&message)).await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.queue_timeout)),
        };

        let correlation_id = match enqueued {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    audiobook_id = %job.audiobook_id,
                    job_type = %job.job_type,
                    error = %err,
                    "queue unavailable, job recorded but not dispatched"
                );
                return DispatchOutcome {
                    job_id: job.id,
                    correlation_id: None,
                    degraded: true,
                };
            }
        };

        let stored = with_store_retry(&self.retry, "set_correlation", || {
            self.store.set_correlation(job.id, correlation_id.as_str())
        })
        .await;

        match stored {
            Ok(_) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    correlation_id = %correlation_id,
                    "job dispatched"
                );
                DispatchOutcome {
                    job_id: job.id,
                    correlation_id: Some(correlation_id),
                    degraded: false,
                }
            }
            Err(err) => {
                // Enqueued, but the record still looks undispatched; the
                // reconciler may send it again, which workers must tolerate.
                warn!(
                    job_id = %job.id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "job enqueued but correlation id not recorded"
                );
                DispatchOutcome {
                    job_id: job.id,
                    correlation_id: Some(correlation_id),
                    degraded: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::queue::InMemoryJobQueue;
    use crate::store::{InMemoryStore, JobStore};
    use narrate_core::JobStatus;
    use serde_json::json;

    fn dispatcher(store: Arc<InMemoryStore>, queue: Arc<InMemoryJobQueue>) -> WorkDispatcher {
        WorkDispatcher::new(
            store,
            queue,
            BackoffPolicy::no_retry(),
            Duration::from_millis(50),
            3,
        )
    }

    #[tokio::test]
    async fn dispatch_records_correlation_id() {
        let (store, queue) = (InMemoryStore::arc(), InMemoryJobQueue::arc());
        let d = dispatcher(store.clone(), queue.clone());
        let out = d
            .create_and_dispatch(AudioBookId::new(), None, JobType::Embed, json!({}))
            .await
            .unwrap();

        assert!(!out.degraded);
        let job = store.get_job(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.correlation_id, out.correlation_id.map(|c| c.0));
        assert_eq!(queue.messages()[0].job_id, out.job_id);
    }

    #[tokio::test]
    async fn offline_queue_degrades_without_losing_the_job() {
        let (store, queue) = (InMemoryStore::arc(), InMemoryJobQueue::arc());
        queue.set_offline(true);
        let d = dispatcher(store.clone(), queue);
        let out = d
            .create_and_dispatch(AudioBookId::new(), None, JobType::Tag, json!({}))
            .await
            .unwrap();

        assert!(out.degraded);
        let job = store.get_job(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.is_undispatched());
    }

    #[tokio::test]
    async fn slow_queue_times_out_as_degraded() {
        let (store, queue) = (InMemoryStore::arc(), InMemoryJobQueue::arc());
        queue.set_delay(Duration::from_millis(500));
        let d = dispatcher(store.clone(), queue);
        let out = d
            .create_and_dispatch(AudioBookId::new(), None, JobType::Tag, json!({}))
            .await
            .unwrap();
        assert!(out.degraded);
        assert!(store.get_job(out.job_id).await.unwrap().unwrap().is_undispatched());
    }

    #[tokio::test]
    async fn record_failure_fails_the_call() {
        let (store, queue) = (InMemoryStore::arc(), InMemoryJobQueue::arc());
        store.fail_next(1);
        let d = dispatcher(store, queue.clone());
        let err = d
            .create_and_dispatch(AudioBookId::new(), None, JobType::Tag, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StorageUnavailable(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn chapter_scope_is_validated() {
        let d = dispatcher(InMemoryStore::arc(), InMemoryJobQueue::arc());
        let err = d
            .create_and_dispatch(AudioBookId::new(), None, JobType::Transcribe, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn work_level_job_is_created_once() {
        let d = dispatcher(InMemoryStore::arc(), InMemoryJobQueue::arc());
        let book = AudioBookId::new();
        assert!(d.create_work_level_once(book, JobType::Summarize, json!({})).await.unwrap().is_some());
        assert!(d.create_work_level_once(book, JobType::Summarize, json!({})).await.unwrap().is_none());
    }
}
