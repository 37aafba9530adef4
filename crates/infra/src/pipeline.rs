//! `Pipeline`: the boundary operations exposed to callers (HTTP handlers and
//! worker callbacks), wired over the upload tracker, dispatcher, gate and
//! aggregator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use narrate_core::{
    AudioBook, AudioBookId, AudioBookStatus, BackoffPolicy, Chapter, ChapterId, ChapterTranscript,
    FileMetadata, JobId, JobStatus, JobType, NewAudioBook, ProcessingJob, RetryPolicy,
    UploadSession, UploadSessionId, UploadSessionStatus, UploadedFile, UploadedFileId, UserId,
};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::jobs::{
    ChapterCompletionGate, DispatchOutcome, GateOutcome, ReconcileReport, Reconciler,
    RecomputeOutcome, StatusAggregator, WorkDispatcher,
};
use crate::queue::JobQueue;
use crate::retry::with_store_retry;
use crate::store::PipelineStore;
use crate::upload_tracker::{UploadProgress, UploadTracker};

/// A worker's report about one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportOutcome {
    pub job: ProcessingJob,
    /// `false` when the report repeated the job's current status.
    pub applied: bool,
    pub gate: Option<GateOutcome>,
    pub aggregate: RecomputeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionOutcome {
    pub audiobook_id: AudioBookId,
    pub chapters: Vec<ChapterId>,
    pub transcribe_jobs: Vec<DispatchOutcome>,
    pub status: Option<AudioBookStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryAllReport {
    pub retried: Vec<JobId>,
    /// Failed jobs whose reset lost to a concurrent writer.
    pub lost_race: Vec<JobId>,
    pub degraded: usize,
}

/// Coarse, client-facing view of an audiobook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioBookStatusView {
    pub audiobook_id: AudioBookId,
    pub title: String,
    pub status: AudioBookStatus,
    pub summary: Option<String>,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub undispatched_jobs: usize,
    /// Completed share of all jobs, 0.0 to 1.0.
    pub progress: f64,
    pub error_summary: Option<String>,
}

impl AudioBookStatusView {
    fn derive(book: &AudioBook, jobs: &[ProcessingJob]) -> Self {
        let count = |s: JobStatus| jobs.iter().filter(|j| j.status == s).count();
        let completed = count(JobStatus::Completed);
        let failed: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Failed).collect();

        let error_summary = (book.status == AudioBookStatus::Failed && !failed.is_empty()).then(|| {
            failed
                .iter()
                .map(|j| {
                    format!(
                        "{} job {}: {}",
                        j.job_type,
                        j.id,
                        j.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        });

        Self {
            audiobook_id: book.id,
            title: book.title.clone(),
            status: book.status,
            summary: book.summary.clone(),
            total_jobs: jobs.len(),
            completed_jobs: completed,
            failed_jobs: failed.len(),
            undispatched_jobs: jobs.iter().filter(|j| j.is_undispatched()).count(),
            progress: if jobs.is_empty() {
                0.0
            } else {
                completed as f64 / jobs.len() as f64
            },
            error_summary,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn PipelineStore>,
    tracker: UploadTracker,
    dispatcher: Arc<WorkDispatcher>,
    gate: ChapterCompletionGate,
    aggregator: StatusAggregator,
    reconciler: Reconciler,
    retry: BackoffPolicy,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        config: PipelineConfig,
    ) -> Self {
        let retry = config.store_retry.clone();
        let dispatcher = Arc::new(WorkDispatcher::new(
            store.clone(),
            queue,
            retry.clone(),
            config.queue_timeout,
            config.max_job_retries,
        ));
        Self {
            tracker: UploadTracker::new(store.clone(), retry.clone(), config.max_file_retries),
            gate: ChapterCompletionGate::new(store.clone(), dispatcher.clone(), retry.clone()),
            aggregator: StatusAggregator::new(store.clone(), retry.clone()),
            reconciler: Reconciler::new(
                store.clone(),
                dispatcher.clone(),
                retry.clone(),
                config.reconcile_after,
            ),
            dispatcher,
            store,
            retry,
        }
    }

    pub fn tracker(&self) -> &UploadTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &WorkDispatcher {
        &self.dispatcher
    }

    pub fn gate(&self) -> &ChapterCompletionGate {
        &self.gate
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    // -- uploads --------------------------------------------------------------

    pub async fn start_upload(
        &self,
        owner: UserId,
        declared_files: u32,
        declared_bytes: u64,
    ) -> PipelineResult<UploadSession> {
        self.tracker
            .start_session(owner, declared_files, declared_bytes)
            .await
    }

    pub async fn register_uploaded_file(
        &self,
        session_id: UploadSessionId,
        metadata: FileMetadata,
    ) -> PipelineResult<UploadedFileId> {
        self.tracker.register_file(session_id, metadata).await
    }

    pub async fn begin_file(
        &self,
        session_id: UploadSessionId,
        metadata: FileMetadata,
    ) -> PipelineResult<UploadedFileId> {
        self.tracker.begin_file(session_id, metadata).await
    }

    pub async fn complete_file(&self, file_id: UploadedFileId) -> PipelineResult<UploadSession> {
        self.tracker.complete_file(file_id).await
    }

    pub async fn mark_file_failed(
        &self,
        file_id: UploadedFileId,
        reason: String,
    ) -> PipelineResult<UploadedFile> {
        self.tracker.mark_failed(file_id, reason).await
    }

    pub async fn retry_file(&self, file_id: UploadedFileId) -> PipelineResult<UploadedFile> {
        self.tracker.retry(file_id).await
    }

    pub async fn upload_progress(
        &self,
        session_id: UploadSessionId,
    ) -> PipelineResult<UploadProgress> {
        self.tracker.progress(session_id).await
    }

    // -- promotion ------------------------------------------------------------

    /// Create the audiobook, its chapters and one transcribe job per chapter
    /// from a completed upload session.
    ///
    /// The records are written in one atomic step. Queue hand-off and the
    /// status fold happen afterwards and never fail the promotion.
    #[instrument(skip(self, details), fields(%session_id, title = %details.title), err)]
    pub async fn promote_session(
        &self,
        session_id: UploadSessionId,
        details: NewAudioBook,
    ) -> PipelineResult<PromotionOutcome> {
        let session = with_store_retry(&self.retry, "get_session", || {
            self.store.get_session(session_id)
        })
        .await?
        .ok_or(PipelineError::SessionNotFound(session_id))?;

        if session.status != UploadSessionStatus::Completed {
            return Err(PipelineError::invalid_transition(
                "upload session",
                session.status,
                "promoted",
            ));
        }
        if session.audiobook_id.is_some() {
            return Err(PipelineError::invalid_transition(
                "upload session",
                "promoted",
                "promoted",
            ));
        }

        let files = with_store_retry(&self.retry, "list_files", || {
            self.store.list_files(session_id)
        })
        .await?;
        let book = AudioBook::new(session.owner, Some(session_id), details)?;
        let chapters = Chapter::plan(book.id, &book.title, &files)?;
        let jobs = chapters
            .iter()
            .map(|chapter| {
                let payload = json!({
                    "storage_path": chapter.storage_path,
                    "chapter_number": chapter.number,
                    "mime_type": chapter.mime_type,
                });
                self.dispatcher
                    .prepare(book.id, Some(chapter.id), JobType::Transcribe, payload)
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        let created = with_store_retry(&self.retry, "create_audiobook", || {
            self.store.create_audiobook(&book, &chapters, &jobs)
        })
        .await?;
        if !created {
            return Err(PipelineError::invalid_transition(
                "upload session",
                "promoted",
                "promoted",
            ));
        }
        info!(audiobook_id = %book.id, %session_id, chapters = chapters.len(), "audiobook created");

        // Undispatched jobs are left to the reconciler.
        let mut transcribe_jobs = Vec::with_capacity(jobs.len());
        for job in &jobs {
            transcribe_jobs.push(self.dispatcher.dispatch_existing(job).await);
        }

        let status = match self.aggregator.recompute(book.id).await {
            Ok(aggregate) => aggregate.status(),
            Err(err) => {
                warn!(audiobook_id = %book.id, error = %err, "status recompute after promotion failed");
                None
            }
        };
        Ok(PromotionOutcome {
            audiobook_id: book.id,
            chapters: chapters.iter().map(|c| c.id).collect(),
            transcribe_jobs,
            status,
        })
    }

    // -- worker callbacks -----------------------------------------------------

    /// Apply a worker report, then run the chapter gate and the aggregator.
    ///
    /// Repeating a report is harmless: the job is not written again, but the
    /// gate and aggregator still run.
    #[instrument(skip(self, report), fields(job_id = %report.job_id, status = %report.status), err)]
    pub async fn report_job_status(&self, report: JobStatusReport) -> PipelineResult<ReportOutcome> {
        let job = self.load_job(report.job_id).await?;
        let prior = job.status;
        let completes_transcription =
            job.job_type == JobType::Transcribe && report.status == JobStatus::Completed;

        let stored_result = if job.job_type == JobType::Transcribe {
            None
        } else {
            report.result.clone()
        };
        let mut updated = job.clone();
        let mut applied =
            updated.apply_report(report.status, stored_result, report.error.clone(), Utc::now())?;

        if completes_transcription {
            self.save_transcript(&job, report.result.as_ref()).await?;
        }

        if applied {
            let written = with_store_retry(&self.retry, "update_job", || {
                self.store.update_job(&updated, prior)
            })
            .await?;
            if !written {
                let current = self.load_job(job.id).await?;
                if current.status != report.status {
                    return Err(PipelineError::Conflict(format!(
                        "job {} moved from {prior} to {} concurrently",
                        job.id, current.status
                    )));
                }
                updated = current;
                applied = false;
            }
        }

        if applied {
            info!(job_id = %job.id, audiobook_id = %job.audiobook_id, job_type = %job.job_type, from = %prior, to = %report.status, "job status updated");
            if report.status == JobStatus::Failed {
                warn!(job_id = %job.id, error = updated.error.as_deref().unwrap_or_default(), "job failed");
            }
        }

        let gate = if report.status == JobStatus::Completed {
            Some(self.gate.check(job.audiobook_id).await?)
        } else {
            None
        };
        let aggregate = self.aggregator.recompute(job.audiobook_id).await?;

        Ok(ReportOutcome {
            job: updated,
            applied,
            gate,
            aggregate,
        })
    }

    async fn save_transcript(&self, job: &ProcessingJob, result: Option<&Value>) -> PipelineResult<()> {
        let chapter_id = job
            .chapter_id
            .ok_or_else(|| PipelineError::Validation(format!("transcribe job {} has no chapter", job.id)))?;
        let content = result
            .and_then(|r| r.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::Validation("transcription result needs a `content` string".to_string())
            })?;
        let language = result
            .and_then(|r| r.get("language"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let transcript = ChapterTranscript::new(chapter_id, content, language);
        let inserted = with_store_retry(&self.retry, "save_transcript", || {
            self.store.save_transcript(&transcript)
        })
        .await?;
        if inserted {
            info!(%chapter_id, job_id = %job.id, chars = content.len(), "chapter transcript stored");
        }
        Ok(())
    }

    // -- operator actions -----------------------------------------------------

    /// Retry one failed job, guarded by its retry policy.
    #[instrument(skip(self), fields(%audiobook_id, %job_id), err)]
    pub async fn retry_job(
        &self,
        audiobook_id: AudioBookId,
        job_id: JobId,
    ) -> PipelineResult<DispatchOutcome> {
        let job = self.load_job(job_id).await?;
        if job.audiobook_id != audiobook_id {
            return Err(PipelineError::not_found("job", job_id));
        }
        if job.status != JobStatus::Failed {
            return Err(PipelineError::invalid_transition("job", job.status, JobStatus::Pending));
        }
        let next = RetryPolicy::decide(job.retry_count, job.max_retries).into_result()?;

        let mut reset = job.clone();
        reset.reset_for_retry(next)?;
        let written = with_store_retry(&self.retry, "update_job", || {
            self.store.update_job(&reset, JobStatus::Failed)
        })
        .await?;
        if !written {
            return Err(PipelineError::Conflict(format!("job {job_id} is no longer failed")));
        }
        info!(%job_id, retry_count = next, "job reset for retry");

        let jobs = self.list_jobs(audiobook_id).await?;
        if !jobs.iter().any(|j| j.status == JobStatus::Failed) {
            self.reopen(audiobook_id).await?;
        }

        let outcome = self.dispatcher.dispatch_existing(&reset).await;
        self.aggregator.recompute(audiobook_id).await?;
        Ok(outcome)
    }

    /// Reset every failed job of the audiobook and dispatch it again.
    #[instrument(skip(self), fields(%audiobook_id), err)]
    pub async fn retry_all_failed_jobs(
        &self,
        audiobook_id: AudioBookId,
    ) -> PipelineResult<RetryAllReport> {
        let book = self.load_audiobook(audiobook_id).await?;
        let failed: Vec<ProcessingJob> = self
            .list_jobs(audiobook_id)
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Failed)
            .collect();
        if failed.is_empty() {
            return Err(PipelineError::invalid_transition(
                "audiobook",
                format!("{} without failed jobs", book.status),
                "retrying",
            ));
        }

        let mut report = RetryAllReport::default();
        let mut to_dispatch = Vec::with_capacity(failed.len());
        for job in failed {
            let mut reset = job;
            reset.reset_for_retry(0)?;
            let written = with_store_retry(&self.retry, "update_job", || {
                self.store.update_job(&reset, JobStatus::Failed)
            })
            .await?;
            if written {
                report.retried.push(reset.id);
                to_dispatch.push(reset);
            } else {
                report.lost_race.push(reset.id);
            }
        }

        self.reopen(audiobook_id).await?;

        for job in &to_dispatch {
            if self.dispatcher.dispatch_existing(job).await.degraded {
                report.degraded += 1;
            }
        }
        self.aggregator.recompute(audiobook_id).await?;

        info!(
            %audiobook_id,
            retried = report.retried.len(),
            lost_race = report.lost_race.len(),
            degraded = report.degraded,
            "failed jobs retried"
        );
        Ok(report)
    }

    /// Re-attempt dispatch of stale undispatched jobs.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> PipelineResult<ReconcileReport> {
        self.reconciler.redispatch_stale(now).await
    }

    // -- diagnostics ----------------------------------------------------------

    pub async fn list_jobs(&self, audiobook_id: AudioBookId) -> PipelineResult<Vec<ProcessingJob>> {
        Ok(with_store_retry(&self.retry, "list_jobs", || {
            self.store.list_jobs(audiobook_id)
        })
        .await?)
    }

    /// Jobs of an existing audiobook; `NotFound` for unknown ids.
    pub async fn audiobook_jobs(
        &self,
        audiobook_id: AudioBookId,
    ) -> PipelineResult<Vec<ProcessingJob>> {
        self.load_audiobook(audiobook_id).await?;
        self.list_jobs(audiobook_id).await
    }

    pub async fn audiobook_status(
        &self,
        audiobook_id: AudioBookId,
    ) -> PipelineResult<AudioBookStatusView> {
        let book = self.load_audiobook(audiobook_id).await?;
        let jobs = self.list_jobs(audiobook_id).await?;
        Ok(AudioBookStatusView::derive(&book, &jobs))
    }

    pub async fn chapters(&self, audiobook_id: AudioBookId) -> PipelineResult<Vec<Chapter>> {
        Ok(with_store_retry(&self.retry, "list_chapters", || {
            self.store.list_chapters(audiobook_id)
        })
        .await?)
    }

    async fn reopen(&self, audiobook_id: AudioBookId) -> PipelineResult<()> {
        let reopened = with_store_retry(&self.retry, "transition_audiobook", || {
            self.store.transition_audiobook(
                audiobook_id,
                AudioBookStatus::Failed,
                AudioBookStatus::Processing,
            )
        })
        .await?;
        if reopened {
            info!(%audiobook_id, "audiobook reopened for processing");
        }
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> PipelineResult<ProcessingJob> {
        with_store_retry(&self.retry, "get_job", || self.store.get_job(id))
            .await?
            .ok_or_else(|| PipelineError::not_found("job", id))
    }

    async fn load_audiobook(&self, id: AudioBookId) -> PipelineResult<AudioBook> {
        with_store_retry(&self.retry, "get_audiobook", || self.store.get_audiobook(id))
            .await?
            .ok_or_else(|| PipelineError::not_found("audiobook", id))
    }
}
