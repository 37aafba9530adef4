//! Chapter Completion Gate: a barrier over the per-chapter transcribe jobs.
//!
//! Fires once per audiobook, when every chapter has a transcript and a
//! completed transcribe job, by creating one summarize and one tag job.
//!
//! The check is not atomic against a concurrent invocation for the same
//! audiobook. Jobs are re-listed right before creation, and the store's
//! uniqueness constraint on work-level jobs settles whatever race remains.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use narrate_core::{AudioBookId, BackoffPolicy, ChapterId, JobStatus, JobType, ProcessingJob};

use crate::error::PipelineResult;
use crate::retry::with_store_retry;
use crate::store::PipelineStore;

use super::dispatcher::{DispatchOutcome, WorkDispatcher};

/// Work-level jobs released by the barrier.
pub const DOWNSTREAM_JOBS: [JobType; 2] = [JobType::Summarize, JobType::Tag];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateOutcome {
    /// The audiobook has no chapters; the gate never fires.
    NoChapters,
    /// Some chapters are not done yet.
    Waiting {
        done: usize,
        total: usize,
        /// Chapters whose latest transcribe job failed. They block until an
        /// operator retry re-runs them.
        failed: Vec<ChapterId>,
    },
    /// Downstream jobs already existed; nothing created.
    AlreadyFired,
    /// This invocation created the listed jobs.
    Fired { created: Vec<DispatchOutcome> },
}

pub struct ChapterCompletionGate {
    store: Arc<dyn PipelineStore>,
    dispatcher: Arc<WorkDispatcher>,
    retry: BackoffPolicy,
}

impl ChapterCompletionGate {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        dispatcher: Arc<WorkDispatcher>,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            retry,
        }
    }

    /// Evaluate the barrier and fire it if satisfied. Safe to call repeatedly.
    #[instrument(skip(self), fields(%audiobook_id), err)]
    pub async fn check(&self, audiobook_id: AudioBookId) -> PipelineResult<GateOutcome> {
        let chapters = with_store_retry(&self.retry, "list_chapters", || {
            self.store.list_chapters(audiobook_id)
        })
        .await?;
        if chapters.is_empty() {
            debug!(%audiobook_id, "no chapters, gate stays closed");
            return Ok(GateOutcome::NoChapters);
        }

        let transcripts = with_store_retry(&self.retry, "transcribed_chapters", || {
            self.store.transcribed_chapters(audiobook_id)
        })
        .await?;
        let jobs = self.list_jobs(audiobook_id).await?;

        let completed = chapters_with_status(&jobs, JobStatus::Completed);
        let failed_chapters = chapters_with_status(&jobs, JobStatus::Failed);

        let done = chapters
            .iter()
            .filter(|c| transcripts.contains(&c.id) && completed.contains(&c.id))
            .count();
        if done < chapters.len() {
            let failed: Vec<ChapterId> = chapters
                .iter()
                .map(|c| c.id)
                .filter(|id| failed_chapters.contains(id) && !completed.contains(id))
                .collect();
            debug!(%audiobook_id, done, total = chapters.len(), failed = failed.len(), "barrier not satisfied");
            return Ok(GateOutcome::Waiting {
                done,
                total: chapters.len(),
                failed,
            });
        }

        if missing_downstream(&jobs).is_empty() {
            return Ok(GateOutcome::AlreadyFired);
        }

        // Re-verify against fresh state immediately before creating.
        let jobs = self.list_jobs(audiobook_id).await?;
        let payload = json!({ "chapter_count": chapters.len() });
        let mut created = Vec::new();
        for job_type in missing_downstream(&jobs) {
            if let Some(outcome) = self
                .dispatcher
                .create_work_level_once(audiobook_id, job_type, payload.clone())
                .await?
            {
                created.push(outcome);
            }
        }

        if created.is_empty() {
            debug!(%audiobook_id, "downstream jobs created concurrently");
            return Ok(GateOutcome::AlreadyFired);
        }
        info!(
            %audiobook_id,
            chapters = chapters.len(),
            created = created.len(),
            "all chapters transcribed, downstream jobs created"
        );
        Ok(GateOutcome::Fired { created })
    }

    async fn list_jobs(&self, audiobook_id: AudioBookId) -> PipelineResult<Vec<ProcessingJob>> {
        Ok(with_store_retry(&self.retry, "list_jobs", || self.store.list_jobs(audiobook_id)).await?)
    }
}

fn chapters_with_status(jobs: &[ProcessingJob], status: JobStatus) -> HashSet<ChapterId> {
    jobs.iter()
        .filter(|j| j.job_type == JobType::Transcribe && j.status == status)
        .filter_map(|j| j.chapter_id)
        .collect()
}

/// Downstream job types not yet recorded for the audiobook.
pub(crate) fn missing_downstream(jobs: &[ProcessingJob]) -> Vec<JobType> {
    DOWNSTREAM_JOBS
        .into_iter()
        .filter(|t| !jobs.iter().any(|j| j.chapter_id.is_none() && j.job_type == *t))
        .collect()
}
