//! Processing jobs.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{AudioBookId, ChapterId, JobId};
use crate::status::JobStatus;

/// Kind of processing a job performs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Speech-to-text for one chapter.
    Transcribe,
    Summarize,
    Tag,
    Embed,
}

impl JobType {
    pub const ALL: &'static [JobType] = &[
        JobType::Transcribe,
        JobType::Summarize,
        JobType::Tag,
        JobType::Embed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Transcribe => "transcribe",
            JobType::Summarize => "summarize",
            JobType::Tag => "tag",
            JobType::Embed => "embed",
        }
    }

    /// Work-level jobs cover the whole audiobook and carry no chapter id.
    pub fn is_work_level(&self) -> bool {
        !matches!(self, JobType::Transcribe)
    }

    /// Reject a chapter scope that does not fit the job type.
    pub fn check_scope(&self, chapter_id: Option<ChapterId>) -> DomainResult<()> {
        match (self.is_work_level(), chapter_id) {
            (false, None) => Err(DomainError::validation(format!(
                "{self} jobs require a chapter id"
            ))),
            (true, Some(_)) => Err(DomainError::validation(format!(
                "{self} jobs are work-level and take no chapter id"
            ))),
            _ => Ok(()),
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// A unit of processing for one chapter or one whole audiobook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: JobId,
    pub audiobook_id: AudioBookId,
    /// `None` for work-level jobs.
    pub chapter_id: Option<ChapterId>,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Message body handed to the queue.
    pub payload: Value,
    /// Queue correlation id; `None` means recorded but not dispatched.
    pub correlation_id: Option<String>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn new(
        audiobook_id: AudioBookId,
        chapter_id: Option<ChapterId>,
        job_type: JobType,
        payload: Value,
        max_retries: u32,
    ) -> DomainResult<Self> {
        job_type.check_scope(chapter_id)?;
        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            audiobook_id,
            chapter_id,
            job_type,
            status: JobStatus::Pending,
            payload,
            correlation_id: None,
            error: None,
            result: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_undispatched(&self) -> bool {
        self.status == JobStatus::Pending && self.correlation_id.is_none()
    }

    /// Apply a worker status report.
    ///
    /// Returns `Ok(false)` when the job already has `next` (duplicate delivery).
    /// Workers can never move a job back to `pending`.
    pub fn apply_report(
        &mut self,
        next: JobStatus,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        if next == self.status {
            return Ok(false);
        }
        if next == JobStatus::Pending {
            return Err(DomainError::invalid_transition("job", self.status, next));
        }
        self.status.check_transition(next)?;

        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Completed => {
                self.completed_at = Some(now);
                self.result = result;
                self.error = None;
            }
            JobStatus::Failed => {
                self.completed_at = Some(now);
                self.error = Some(error.unwrap_or_else(|| "unknown error".to_string()));
            }
            JobStatus::Pending => {}
        }
        self.updated_at = now;
        Ok(true)
    }

    /// `failed -> pending` for an operator retry.
    pub fn reset_for_retry(&mut self, retry_count: u32) -> DomainResult<()> {
        self.status.check_transition(JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.retry_count = retry_count;
        self.correlation_id = None;
        self.error = None;
        self.result = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Entity for ProcessingJob {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
