//! Record store abstractions.
//!
//! The orchestration components only need create/read, list-by-parent, and a
//! conditional update that succeeds only while the row still holds an expected
//! prior status. Every conditional method reports whether it applied, so the
//! caller can re-read and decide instead of overwriting a concurrent change.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use narrate_core::{
    AudioBook, AudioBookId, AudioBookStatus, Chapter, ChapterId, ChapterTranscript, JobId,
    JobStatus, ProcessingJob, UploadFileStatus, UploadSession, UploadSessionId,
    UploadSessionStatus, UploadedFile, UploadedFileId,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint rejected the write.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Transient failure (connection refused, pool timeout). Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of offering a new file to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAdmission {
    /// File stored; carries the session as it stands after the insert.
    Admitted(UploadSession),
    /// The session already holds its declared number of files.
    SessionFull(UploadSession),
    SessionCompleted(UploadSession),
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn insert_session(&self, session: &UploadSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: UploadSessionId) -> Result<Option<UploadSession>, StoreError>;

    /// Conditional `expected -> next`.
    async fn transition_session(
        &self,
        id: UploadSessionId,
        expected: UploadSessionStatus,
        next: UploadSessionStatus,
    ) -> Result<bool, StoreError>;

    /// Insert `file` unless the session is completed or full.
    ///
    /// An `uploaded` file increments the session counters in the same atomic step.
    async fn admit_file(&self, file: &UploadedFile) -> Result<FileAdmission, StoreError>;

    async fn get_file(&self, id: UploadedFileId) -> Result<Option<UploadedFile>, StoreError>;

    async fn list_files(&self, session_id: UploadSessionId)
    -> Result<Vec<UploadedFile>, StoreError>;

    /// Conditional `expected -> uploaded` plus atomic session counter increment.
    ///
    /// Returns the updated session, or `None` if the file no longer had `expected`.
    async fn mark_file_uploaded(
        &self,
        id: UploadedFileId,
        expected: UploadFileStatus,
    ) -> Result<Option<UploadSession>, StoreError>;

    /// Conditional write of a file's status, retry count and error.
    async fn update_file(
        &self,
        file: &UploadedFile,
        expected: UploadFileStatus,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Create an audiobook with its chapters and initial jobs.
    ///
    /// When the audiobook names a source session, the session is claimed in the
    /// same atomic step: it must be `completed` and not yet claimed, otherwise
    /// nothing is written and `Ok(false)` is returned.
    async fn create_audiobook(
        &self,
        audiobook: &AudioBook,
        chapters: &[Chapter],
        jobs: &[ProcessingJob],
    ) -> Result<bool, StoreError>;

    async fn get_audiobook(&self, id: AudioBookId) -> Result<Option<AudioBook>, StoreError>;

    async fn transition_audiobook(
        &self,
        id: AudioBookId,
        expected: AudioBookStatus,
        next: AudioBookStatus,
    ) -> Result<bool, StoreError>;

    async fn set_summary(&self, id: AudioBookId, summary: &str) -> Result<(), StoreError>;

    /// Chapters ordered by number.
    async fn list_chapters(&self, audiobook_id: AudioBookId) -> Result<Vec<Chapter>, StoreError>;

    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, StoreError>;

    /// Store a transcript; the first write wins. Returns `false` if one existed.
    async fn save_transcript(&self, transcript: &ChapterTranscript) -> Result<bool, StoreError>;

    async fn get_transcript(
        &self,
        chapter_id: ChapterId,
    ) -> Result<Option<ChapterTranscript>, StoreError>;

    /// Ids of the audiobook's chapters that have a transcript.
    async fn transcribed_chapters(
        &self,
        audiobook_id: AudioBookId,
    ) -> Result<HashSet<ChapterId>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fails with `Duplicate` when a work-level job of the same type already
    /// exists for the audiobook.
    async fn insert_job(&self, job: &ProcessingJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError>;

    /// Jobs ordered by creation time.
    async fn list_jobs(&self, audiobook_id: AudioBookId)
    -> Result<Vec<ProcessingJob>, StoreError>;

    /// Conditional write of the job's mutable fields while it still has `expected`.
    async fn update_job(&self, job: &ProcessingJob, expected: JobStatus)
    -> Result<bool, StoreError>;

    /// Record the queue correlation id if none is set yet.
    async fn set_correlation(&self, id: JobId, correlation_id: &str) -> Result<bool, StoreError>;

    /// `pending` jobs without a correlation id, last updated before `older_than`.
    async fn list_undispatched(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ProcessingJob>, StoreError>;
}

/// Everything the pipeline persists.
pub trait PipelineStore: UploadStore + CatalogStore + JobStore {}

impl<T: UploadStore + CatalogStore + JobStore> PipelineStore for T {}
