//! Status Aggregator: folds an audiobook's jobs into its lifecycle status.
//!
//! `recompute` only ever folds state; it never retries or creates jobs.
//! `failed` is sticky here: once an audiobook is failed only an operator
//! retry moves it back to `processing`. An audiobook with transcribe jobs
//! stays `processing` until every downstream job exists.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use narrate_core::{
    AudioBook, AudioBookId, AudioBookStatus, BackoffPolicy, JobStatus, JobType, ProcessingJob,
};

use crate::error::{PipelineError, PipelineResult};
use crate::retry::with_store_retry;
use crate::store::PipelineStore;

use super::gate::missing_downstream;

/// Conditional writes retried this many times when a concurrent writer moves
/// the audiobook between our read and write.
const MAX_CAS_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecomputeOutcome {
    /// No jobs yet; status left untouched.
    NoJobs,
    Unchanged { status: AudioBookStatus },
    Changed {
        from: AudioBookStatus,
        to: AudioBookStatus,
    },
    /// The audiobook is failed and the jobs would fold to something else.
    HeldFailed { derived: AudioBookStatus },
}

impl RecomputeOutcome {
    pub fn status(&self) -> Option<AudioBookStatus> {
        match self {
            RecomputeOutcome::NoJobs => None,
            RecomputeOutcome::Unchanged { status } => Some(*status),
            RecomputeOutcome::Changed { to, .. } => Some(*to),
            RecomputeOutcome::HeldFailed { .. } => Some(AudioBookStatus::Failed),
        }
    }
}

pub struct StatusAggregator {
    store: Arc<dyn PipelineStore>,
    retry: BackoffPolicy,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn PipelineStore>, retry: BackoffPolicy) -> Self {
        Self { store, retry }
    }

    #[instrument(skip(self), fields(%audiobook_id), err)]
    pub async fn recompute(&self, audiobook_id: AudioBookId) -> PipelineResult<RecomputeOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let book = self.load(audiobook_id).await?;
            let jobs = with_store_retry(&self.retry, "list_jobs", || {
                self.store.list_jobs(audiobook_id)
            })
            .await?;

            let Some(derived) = derive_status(&jobs) else {
                debug!(%audiobook_id, "no jobs, status untouched");
                return Ok(RecomputeOutcome::NoJobs);
            };

            if book.status == AudioBookStatus::Failed && derived != AudioBookStatus::Failed {
                debug!(%audiobook_id, %derived, "audiobook failed, waiting for operator retry");
                return Ok(RecomputeOutcome::HeldFailed { derived });
            }

            if derived == book.status {
                self.write_summary(&book, &jobs).await?;
                return Ok(RecomputeOutcome::Unchanged { status: derived });
            }

            book.status.check_transition(derived)?;
            let moved = with_store_retry(&self.retry, "transition_audiobook", || {
                self.store
                    .transition_audiobook(audiobook_id, book.status, derived)
            })
            .await?;

            if moved {
                info!(%audiobook_id, from = %book.status, to = %derived, jobs = jobs.len(), "audiobook status changed");
                self.write_summary(&book, &jobs).await?;
                return Ok(RecomputeOutcome::Changed {
                    from: book.status,
                    to: derived,
                });
            }
            debug!(%audiobook_id, attempt, "audiobook changed concurrently, re-reading");
        }

        warn!(%audiobook_id, "gave up recomputing status after repeated write conflicts");
        Err(PipelineError::Conflict(format!(
            "audiobook {audiobook_id} kept changing during recompute"
        )))
    }

    /// Copy the summarize job's summary onto a completed audiobook.
    ///
    /// Deterministic and skipped when the stored value already matches, so
    /// repeating it is harmless.
    async fn write_summary(&self, book: &AudioBook, jobs: &[ProcessingJob]) -> PipelineResult<()> {
        if derive_status(jobs) != Some(AudioBookStatus::Completed) {
            return Ok(());
        }
        let Some(summary) = extract_summary(jobs) else {
            return Ok(());
        };
        if book.summary.as_deref() == Some(summary) {
            return Ok(());
        }

        with_store_retry(&self.retry, "set_summary", || {
            self.store.set_summary(book.id, summary)
        })
        .await?;
        info!(audiobook_id = %book.id, chars = summary.len(), "summary stored");
        Ok(())
    }

    async fn load(&self, id: AudioBookId) -> PipelineResult<AudioBook> {
        with_store_retry(&self.retry, "get_audiobook", || self.store.get_audiobook(id))
            .await?
            .ok_or_else(|| PipelineError::not_found("audiobook", id))
    }
}

/// Fold job statuses, holding a fully completed transcription as
/// `processing` while the barrier's downstream jobs are still missing.
pub fn derive_status(jobs: &[ProcessingJob]) -> Option<AudioBookStatus> {
    let folded = AudioBookStatus::fold(jobs.iter().map(|j| j.status))?;
    let awaiting_downstream = folded == AudioBookStatus::Completed
        && jobs.iter().any(|j| j.job_type == JobType::Transcribe)
        && !missing_downstream(jobs).is_empty();
    if awaiting_downstream {
        return Some(AudioBookStatus::Processing);
    }
    Some(folded)
}

/// `result.summary` of the completed summarize job, if any.
pub fn extract_summary(jobs: &[ProcessingJob]) -> Option<&str> {
    jobs.iter()
        .filter(|j| j.job_type == JobType::Summarize && j.status == JobStatus::Completed)
        .find_map(|j| j.result.as_ref()?.get("summary")?.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogStore, InMemoryStore, JobStore};
    use chrono::Utc;
    use narrate_core::{ChapterId, NewAudioBook, UserId};
    use serde_json::{Value, json};

    async fn setup() -> (Arc<InMemoryStore>, StatusAggregator, AudioBookId) {
        let store = InMemoryStore::arc();
        let book = AudioBook::new(
            UserId::new(),
            None,
            NewAudioBook {
                title: "Book".into(),
                author: None,
                language: None,
                is_public: false,
            },
        )
        .unwrap();
        store.create_audiobook(&book, &[], &[]).await.unwrap();
        let agg = StatusAggregator::new(store.clone(), BackoffPolicy::no_retry());
        (store, agg, book.id)
    }

    async fn add_job(store: &InMemoryStore, book: AudioBookId, job_type: JobType) -> ProcessingJob {
        let chapter = (!job_type.is_work_level()).then(ChapterId::new);
        let job = ProcessingJob::new(book, chapter, job_type, json!({}), 3).unwrap();
        store.insert_job(&job).await.unwrap();
        job
    }

    async fn report(store: &InMemoryStore, job: &ProcessingJob, status: JobStatus, result: Option<Value>) {
        let mut updated = store.get_job(job.id).await.unwrap().unwrap();
        let prior = updated.status;
        updated
            .apply_report(status, result, Some("boom".into()), Utc::now())
            .unwrap();
        assert!(store.update_job(&updated, prior).await.unwrap());
    }

    #[tokio::test]
    async fn zero_jobs_is_a_no_op() {
        let (store, agg, book) = setup().await;
        assert_eq!(agg.recompute(book).await.unwrap(), RecomputeOutcome::NoJobs);
        let stored = store.get_audiobook(book).await.unwrap().unwrap();
        assert_eq!(stored.status, AudioBookStatus::Pending);
    }

    #[tokio::test]
    async fn pending_jobs_mean_processing() {
        let (store, agg, book) = setup().await;
        add_job(&store, book, JobType::Transcribe).await;
        assert_eq!(
            agg.recompute(book).await.unwrap(),
            RecomputeOutcome::Changed {
                from: AudioBookStatus::Pending,
                to: AudioBookStatus::Processing
            }
        );
    }

    #[tokio::test]
    async fn failed_is_sticky() {
        let (store, agg, book) = setup().await;
        let a = add_job(&store, book, JobType::Transcribe).await;
        let b = add_job(&store, book, JobType::Transcribe).await;
        agg.recompute(book).await.unwrap();

        report(&store, &a, JobStatus::Failed, None).await;
        assert_eq!(agg.recompute(book).await.unwrap().status(), Some(AudioBookStatus::Failed));

        report(&store, &b, JobStatus::Completed, None).await;
        assert!(matches!(
            agg.recompute(book).await.unwrap(),
            RecomputeOutcome::HeldFailed { .. }
        ));
        let stored = store.get_audiobook(book).await.unwrap().unwrap();
        assert_eq!(stored.status, AudioBookStatus::Failed);
    }

    #[tokio::test]
    async fn summary_written_once_and_stable() {
        let (store, agg, book) = setup().await;
        let s = add_job(&store, book, JobType::Summarize).await;
        let t = add_job(&store, book, JobType::Tag).await;
        agg.recompute(book).await.unwrap();

        report(&store, &s, JobStatus::Completed, Some(json!({"summary": "A whale of a tale.", "tags": []}))).await;
        report(&store, &t, JobStatus::Completed, None).await;

        assert_eq!(agg.recompute(book).await.unwrap().status(), Some(AudioBookStatus::Completed));
        let first = store.get_audiobook(book).await.unwrap().unwrap();
        assert_eq!(first.summary.as_deref(), Some("A whale of a tale."));

        assert_eq!(
            agg.recompute(book).await.unwrap(),
            RecomputeOutcome::Unchanged { status: AudioBookStatus::Completed }
        );
        let second = store.get_audiobook(book).await.unwrap().unwrap();
        assert_eq!(second.summary, first.summary);
        assert_eq!(second.updated_at, first.updated_at);
    }

    #[tokio::test]
    async fn new_work_reopens_completed_book() {
        let (store, agg, book) = setup().await;
        let t = add_job(&store, book, JobType::Tag).await;
        report(&store, &t, JobStatus::Completed, None).await;
        assert_eq!(agg.recompute(book).await.unwrap().status(), Some(AudioBookStatus::Completed));

        add_job(&store, book, JobType::Embed).await;
        assert_eq!(
            agg.recompute(book).await.unwrap(),
            RecomputeOutcome::Changed {
                from: AudioBookStatus::Completed,
                to: AudioBookStatus::Processing
            }
        );
    }

    #[tokio::test]
    async fn completed_transcription_waits_for_every_downstream_job() {
        let (store, agg, book) = setup().await;
        let transcribe = add_job(&store, book, JobType::Transcribe).await;
        report(&store, &transcribe, JobStatus::Completed, None).await;
        assert_eq!(agg.recompute(book).await.unwrap().status(), Some(AudioBookStatus::Processing));

        let summarize = add_job(&store, book, JobType::Summarize).await;
        report(&store, &summarize, JobStatus::Completed, Some(json!({"summary": "Early."}))).await;
        assert_eq!(
            agg.recompute(book).await.unwrap(),
            RecomputeOutcome::Unchanged { status: AudioBookStatus::Processing }
        );
        let stored = store.get_audiobook(book).await.unwrap().unwrap();
        assert_eq!(stored.summary, None);

        let tag = add_job(&store, book, JobType::Tag).await;
        report(&store, &tag, JobStatus::Completed, None).await;
        assert_eq!(agg.recompute(book).await.unwrap().status(), Some(AudioBookStatus::Completed));
        let stored = store.get_audiobook(book).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("Early."));
    }

    #[test]
    fn summary_extraction_ignores_blank_and_incomplete() {
        let book = AudioBookId::new();
        let mut job = ProcessingJob::new(book, None, JobType::Summarize, json!({}), 3).unwrap();
        job.result = Some(json!({"summary": "   "}));
        job.status = JobStatus::Completed;
        assert_eq!(extract_summary(std::slice::from_ref(&job)), None);

        job.result = Some(json!({"summary": "Short."}));
        job.status = JobStatus::Running;
        assert_eq!(extract_summary(std::slice::from_ref(&job)), None);
    }
}
