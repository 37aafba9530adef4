//! Postgres-backed record store.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `StoreError` |
//! |------------|-----------------|--------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | any other | `Storage` |
//! | `PoolTimedOut`, `PoolClosed`, `Io`, `Tls` | n/a | `Unavailable` |
//! | Other | n/a | `Storage` |
//!
//! Conditional updates carry the expected prior status in the `WHERE` clause;
//! a zero row count means another writer got there first.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use narrate_core::{
    AudioBook, AudioBookId, AudioBookStatus, Chapter, ChapterId, ChapterTranscript, FileMetadata,
    JobId, JobStatus, ProcessingJob, UploadFileStatus, UploadSession, UploadSessionId,
    UploadSessionStatus, UploadedFile, UploadedFileId, UserId,
};

use super::{CatalogStore, FileAdmission, JobStore, StoreError, UploadStore};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SESSION_COLUMNS: &str = "id, owner_id, total_files, total_bytes, status, uploaded_files, \
     uploaded_bytes, audiobook_id, created_at, updated_at";

const FILE_COLUMNS: &str = "id, session_id, file_name, size_bytes, mime_type, storage_path, \
     chapter_number, chapter_title, status, retry_count, max_retries, error, created_at, updated_at";

const AUDIOBOOK_COLUMNS: &str = "id, owner_id, source_session_id, title, author, language, \
     is_public, status, summary, created_at, updated_at";

const CHAPTER_COLUMNS: &str =
    "id, audiobook_id, number, title, source_file_id, storage_path, mime_type, created_at";

const JOB_COLUMNS: &str = "id, audiobook_id, chapter_id, job_type, status, payload, \
     correlation_id, error, result, retry_count, max_retries, started_at, completed_at, \
     created_at, updated_at";

/// Postgres implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl UploadStore for PostgresStore {
    #[instrument(skip(self, session), fields(session_id = %session.id), err)]
    async fn insert_session(&self, session: &UploadSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, owner_id, total_files, total_bytes, status,
                uploaded_files, uploaded_bytes, audiobook_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(session.owner.as_uuid())
        .bind(session.total_files as i32)
        .bind(session.total_bytes as i64)
        .bind(session.status.as_str())
        .bind(session.uploaded_files as i32)
        .bind(session.uploaded_bytes as i64)
        .bind(session.audiobook_id.map(|id| *id.as_uuid()))
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_session", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %id), err)]
    async fn get_session(&self, id: UploadSessionId) -> Result<Option<UploadSession>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_session", e))?;
        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(skip(self), fields(session_id = %id, %expected, %next), err)]
    async fn transition_session(
        &self,
        id: UploadSessionId,
        expected: UploadSessionStatus,
        next: UploadSessionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_session", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.get_session(id)
            .await?
            .ok_or_else(|| StoreError::not_found("upload session", id))?;
        Ok(false)
    }

    #[instrument(skip(self, file), fields(session_id = %file.session_id, file_id = %file.id), err)]
    async fn admit_file(&self, file: &UploadedFile) -> Result<FileAdmission, StoreError> {
        let mut tx = self.begin().await?;

        // Row lock serialises concurrent admissions to the same session.
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = $1 FOR UPDATE"
        ))
        .bind(file.session_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_session", e))?
        .ok_or_else(|| StoreError::not_found("upload session", file.session_id))?;
        let session = session_from_row(&row)?;

        if session.status == UploadSessionStatus::Completed {
            return Ok(FileAdmission::SessionCompleted(session));
        }

        let held: i64 = sqlx::query("SELECT COUNT(*) AS held FROM uploaded_files WHERE session_id = $1")
            .bind(file.session_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count_files", e))?
            .try_get("held")
            .map_err(|e| map_sqlx_error("count_files", e))?;
        if held >= i64::from(session.total_files) {
            return Ok(FileAdmission::SessionFull(session));
        }

        let m = &file.metadata;
        sqlx::query(
            r#"
            INSERT INTO uploaded_files (
                id, session_id, file_name, size_bytes, mime_type, storage_path,
                chapter_number, chapter_title, status, retry_count, max_retries, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(file.id.as_uuid())
        .bind(file.session_id.as_uuid())
        .bind(&m.file_name)
        .bind(m.size_bytes as i64)
        .bind(&m.mime_type)
        .bind(&m.storage_path)
        .bind(m.chapter_number.map(|n| n as i32))
        .bind(&m.chapter_title)
        .bind(file.status.as_str())
        .bind(file.retry_count as i32)
        .bind(file.max_retries as i32)
        .bind(&file.error)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_file", e))?;

        let session = if file.status == UploadFileStatus::Uploaded {
            let row = sqlx::query(&format!(
                "UPDATE upload_sessions \
                 SET uploaded_files = uploaded_files + 1, uploaded_bytes = uploaded_bytes + $2, updated_at = NOW() \
                 WHERE id = $1 RETURNING {SESSION_COLUMNS}"
            ))
            .bind(file.session_id.as_uuid())
            .bind(m.size_bytes as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("increment_session", e))?;
            session_from_row(&row)?
        } else {
            session
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(FileAdmission::Admitted(session))
    }

    #[instrument(skip(self), fields(file_id = %id), err)]
    async fn get_file(&self, id: UploadedFileId) -> Result<Option<UploadedFile>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM uploaded_files WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_file", e))?;
        row.as_ref().map(file_from_row).transpose()
    }

    #[instrument(skip(self), fields(%session_id, file_count = tracing::field::Empty), err)]
    async fn list_files(
        &self,
        session_id: UploadSessionId,
    ) -> Result<Vec<UploadedFile>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM uploaded_files WHERE session_id = $1 ORDER BY created_at, id"
        ))
        .bind(session_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_files", e))?;

        Span::current().record("file_count", rows.len());
        rows.iter().map(file_from_row).collect()
    }

    #[instrument(skip(self), fields(file_id = %id, %expected), err)]
    async fn mark_file_uploaded(
        &self,
        id: UploadedFileId,
        expected: UploadFileStatus,
    ) -> Result<Option<UploadSession>, StoreError> {
        let mut tx = self.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE uploaded_files
            SET status = 'uploaded', error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING session_id, size_bytes
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_file_uploaded", e))?;

        let Some(updated) = updated else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            self.get_file(id)
                .await?
                .ok_or_else(|| StoreError::not_found("uploaded file", id))?;
            return Ok(None);
        };

        let session_id: Uuid = updated
            .try_get("session_id")
            .map_err(|e| map_sqlx_error("mark_file_uploaded", e))?;
        let size_bytes: i64 = updated
            .try_get("size_bytes")
            .map_err(|e| map_sqlx_error("mark_file_uploaded", e))?;

        let row = sqlx::query(&format!(
            "UPDATE upload_sessions \
             SET uploaded_files = uploaded_files + 1, uploaded_bytes = uploaded_bytes + $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(size_bytes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("increment_session", e))?;
        let session = session_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(session))
    }

    #[instrument(skip(self, file), fields(file_id = %file.id, %expected, next = %file.status), err)]
    async fn update_file(
        &self,
        file: &UploadedFile,
        expected: UploadFileStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE uploaded_files
            SET status = $3, retry_count = $4, error = $5, updated_at = $6
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(file.id.as_uuid())
        .bind(expected.as_str())
        .bind(file.status.as_str())
        .bind(file.retry_count as i32)
        .bind(&file.error)
        .bind(file.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_file", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.get_file(file.id)
            .await?
            .ok_or_else(|| StoreError::not_found("uploaded file", file.id))?;
        Ok(false)
    }
}

#[async_trait]
impl CatalogStore for PostgresStore {
    #[instrument(
        skip(self, audiobook, chapters, jobs),
        fields(audiobook_id = %audiobook.id, chapter_count = chapters.len(), job_count = jobs.len()),
        err
    )]
    async fn create_audiobook(
        &self,
        audiobook: &AudioBook,
        chapters: &[Chapter],
        jobs: &[ProcessingJob],
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;

        if let Some(session_id) = audiobook.source_session_id {
            let claimed = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET audiobook_id = $2, updated_at = NOW()
                WHERE id = $1 AND status = 'completed' AND audiobook_id IS NULL
                "#,
            )
            .bind(session_id.as_uuid())
            .bind(audiobook.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_session", e))?;

            if claimed.rows_affected() == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                self.get_session(session_id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("upload session", session_id))?;
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO audiobooks (
                id, owner_id, source_session_id, title, author, language,
                is_public, status, summary, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(audiobook.id.as_uuid())
        .bind(audiobook.owner.as_uuid())
        .bind(audiobook.source_session_id.map(|id| *id.as_uuid()))
        .bind(&audiobook.title)
        .bind(&audiobook.author)
        .bind(&audiobook.language)
        .bind(audiobook.is_public)
        .bind(audiobook.status.as_str())
        .bind(&audiobook.summary)
        .bind(audiobook.created_at)
        .bind(audiobook.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_audiobook", e))?;

        for chapter in chapters {
            sqlx::query(
                r#"
                INSERT INTO chapters (
                    id, audiobook_id, number, title, source_file_id, storage_path, mime_type, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(chapter.id.as_uuid())
            .bind(chapter.audiobook_id.as_uuid())
            .bind(chapter.number as i32)
            .bind(&chapter.title)
            .bind(chapter.source_file_id.as_uuid())
            .bind(&chapter.storage_path)
            .bind(&chapter.mime_type)
            .bind(chapter.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_chapter", e))?;
        }

        for job in jobs {
            insert_job_query(job)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_job", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(audiobook_id = %id), err)]
    async fn get_audiobook(&self, id: AudioBookId) -> Result<Option<AudioBook>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AUDIOBOOK_COLUMNS} FROM audiobooks WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_audiobook", e))?;
        row.as_ref().map(audiobook_from_row).transpose()
    }

    #[instrument(skip(self), fields(audiobook_id = %id, %expected, %next), err)]
    async fn transition_audiobook(
        &self,
        id: AudioBookId,
        expected: AudioBookStatus,
        next: AudioBookStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE audiobooks SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_audiobook", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.get_audiobook(id)
            .await?
            .ok_or_else(|| StoreError::not_found("audiobook", id))?;
        Ok(false)
    }

    #[instrument(skip(self, summary), fields(audiobook_id = %id), err)]
    async fn set_summary(&self, id: AudioBookId, summary: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE audiobooks SET summary = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(summary)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_summary", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("audiobook", id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(%audiobook_id), err)]
    async fn list_chapters(&self, audiobook_id: AudioBookId) -> Result<Vec<Chapter>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE audiobook_id = $1 ORDER BY number"
        ))
        .bind(audiobook_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_chapters", e))?;
        rows.iter().map(chapter_from_row).collect()
    }

    #[instrument(skip(self), fields(chapter_id = %id), err)]
    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_chapter", e))?;
        row.as_ref().map(chapter_from_row).transpose()
    }

    #[instrument(skip(self, transcript), fields(chapter_id = %transcript.chapter_id), err)]
    async fn save_transcript(&self, transcript: &ChapterTranscript) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO chapter_transcripts (chapter_id, content, language, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chapter_id) DO NOTHING
            "#,
        )
        .bind(transcript.chapter_id.as_uuid())
        .bind(&transcript.content)
        .bind(&transcript.language)
        .bind(transcript.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_transcript", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(%chapter_id), err)]
    async fn get_transcript(
        &self,
        chapter_id: ChapterId,
    ) -> Result<Option<ChapterTranscript>, StoreError> {
        let row = sqlx::query(
            "SELECT chapter_id, content, language, created_at FROM chapter_transcripts WHERE chapter_id = $1",
        )
        .bind(chapter_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_transcript", e))?;

        row.map(|row| -> Result<ChapterTranscript, sqlx::Error> {
            Ok(ChapterTranscript {
                chapter_id: ChapterId::from_uuid(row.try_get("chapter_id")?),
                content: row.try_get("content")?,
                language: row.try_get("language")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("get_transcript", e))
    }

    #[instrument(skip(self), fields(%audiobook_id), err)]
    async fn transcribed_chapters(
        &self,
        audiobook_id: AudioBookId,
    ) -> Result<HashSet<ChapterId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT t.chapter_id
            FROM chapter_transcripts t
            JOIN chapters c ON c.id = t.chapter_id
            WHERE c.audiobook_id = $1
            "#,
        )
        .bind(audiobook_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transcribed_chapters", e))?;
        Ok(ids.into_iter().map(ChapterId::from_uuid).collect())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, audiobook_id = %job.audiobook_id, job_type = %job.job_type),
        err
    )]
    async fn insert_job(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        insert_job_query(job)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(%audiobook_id, job_count = tracing::field::Empty), err)]
    async fn list_jobs(
        &self,
        audiobook_id: AudioBookId,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE audiobook_id = $1 ORDER BY created_at, id"
        ))
        .bind(audiobook_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        Span::current().record("job_count", rows.len());
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, %expected, next = %job.status), err)]
    async fn update_job(
        &self,
        job: &ProcessingJob,
        expected: JobStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = $3, correlation_id = $4, error = $5, result = $6, retry_count = $7,
                started_at = $8, completed_at = $9, updated_at = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(expected.as_str())
        .bind(job.status.as_str())
        .bind(&job.correlation_id)
        .bind(&job.error)
        .bind(&job.result)
        .bind(job.retry_count as i32)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.get_job(job.id)
            .await?
            .ok_or_else(|| StoreError::not_found("job", job.id))?;
        Ok(false)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn set_correlation(&self, id: JobId, correlation_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET correlation_id = $2, updated_at = NOW()
            WHERE id = $1 AND correlation_id IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(correlation_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_correlation", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.get_job(id)
            .await?
            .ok_or_else(|| StoreError::not_found("job", id))?;
        Ok(false)
    }

    #[instrument(skip(self), err)]
    async fn list_undispatched(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs \
             WHERE status = 'pending' AND correlation_id IS NULL AND updated_at < $1 \
             ORDER BY created_at"
        ))
        .bind(older_than)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_undispatched", e))?;
        rows.iter().map(job_from_row).collect()
    }
}

fn insert_job_query(job: &ProcessingJob) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO processing_jobs (
            id, audiobook_id, chapter_id, job_type, status, payload, correlation_id,
            error, result, retry_count, max_retries, started_at, completed_at,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.audiobook_id.as_uuid())
    .bind(job.chapter_id.map(|id| *id.as_uuid()))
    .bind(job.job_type.as_str())
    .bind(job.status.as_str())
    .bind(&job.payload)
    .bind(&job.correlation_id)
    .bind(&job.error)
    .bind(&job.result)
    .bind(job.retry_count as i32)
    .bind(job.max_retries as i32)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.created_at)
    .bind(job.updated_at)
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode_error(operation: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("failed to decode row in {operation}: {err}"))
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = row.try_get(column).map_err(|e| decode_error(column, e))?;
    text.parse().map_err(|e| decode_error(column, e))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(|e| decode_error(column, e))
}

fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let n: i32 = get(row, column)?;
    u32::try_from(n).map_err(|e| decode_error(column, e))
}

fn bytes(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let n: i64 = get(row, column)?;
    u64::try_from(n).map_err(|e| decode_error(column, e))
}

fn session_from_row(row: &PgRow) -> Result<UploadSession, StoreError> {
    Ok(UploadSession {
        id: UploadSessionId::from_uuid(get(row, "id")?),
        owner: UserId::from_uuid(get(row, "owner_id")?),
        total_files: count(row, "total_files")?,
        total_bytes: bytes(row, "total_bytes")?,
        status: parse_column(row, "status")?,
        uploaded_files: count(row, "uploaded_files")?,
        uploaded_bytes: bytes(row, "uploaded_bytes")?,
        audiobook_id: get::<Option<Uuid>>(row, "audiobook_id")?.map(AudioBookId::from_uuid),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn file_from_row(row: &PgRow) -> Result<UploadedFile, StoreError> {
    let chapter_number: Option<i32> = get(row, "chapter_number")?;
    Ok(UploadedFile {
        id: UploadedFileId::from_uuid(get(row, "id")?),
        session_id: UploadSessionId::from_uuid(get(row, "session_id")?),
        metadata: FileMetadata {
            file_name: get(row, "file_name")?,
            size_bytes: bytes(row, "size_bytes")?,
            mime_type: get(row, "mime_type")?,
            storage_path: get(row, "storage_path")?,
            chapter_number: chapter_number
                .map(u32::try_from)
                .transpose()
                .map_err(|e| decode_error("chapter_number", e))?,
            chapter_title: get(row, "chapter_title")?,
        },
        status: parse_column(row, "status")?,
        retry_count: count(row, "retry_count")?,
        max_retries: count(row, "max_retries")?,
        error: get(row, "error")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn audiobook_from_row(row: &PgRow) -> Result<AudioBook, StoreError> {
    Ok(AudioBook {
        id: AudioBookId::from_uuid(get(row, "id")?),
        owner: UserId::from_uuid(get(row, "owner_id")?),
        source_session_id: get::<Option<Uuid>>(row, "source_session_id")?
            .map(UploadSessionId::from_uuid),
        title: get(row, "title")?,
        author: get(row, "author")?,
        language: get(row, "language")?,
        is_public: get(row, "is_public")?,
        status: parse_column(row, "status")?,
        summary: get(row, "summary")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn chapter_from_row(row: &PgRow) -> Result<Chapter, StoreError> {
    Ok(Chapter {
        id: ChapterId::from_uuid(get(row, "id")?),
        audiobook_id: AudioBookId::from_uuid(get(row, "audiobook_id")?),
        number: count(row, "number")?,
        title: get(row, "title")?,
        source_file_id: UploadedFileId::from_uuid(get(row, "source_file_id")?),
        storage_path: get(row, "storage_path")?,
        mime_type: get(row, "mime_type")?,
        created_at: get(row, "created_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ProcessingJob, StoreError> {
    Ok(ProcessingJob {
        id: JobId::from_uuid(get(row, "id")?),
        audiobook_id: AudioBookId::from_uuid(get(row, "audiobook_id")?),
        chapter_id: get::<Option<Uuid>>(row, "chapter_id")?.map(ChapterId::from_uuid),
        job_type: parse_column(row, "job_type")?,
        status: parse_column(row, "status")?,
        payload: get(row, "payload")?,
        correlation_id: get(row, "correlation_id")?,
        error: get(row, "error")?,
        result: get(row, "result")?,
        retry_count: count(row, "retry_count")?,
        max_retries: count(row, "max_retries")?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use narrate_core::{JobType, NewAudioBook};
    use serde_json::json;
    use tracing::field::{Field, Visit};
    use tracing::span::{Id, Record};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, Registry};

    /// Names of span fields recorded after span creation.
    #[derive(Clone, Default)]
    struct RecordedFields(Arc<Mutex<Vec<String>>>);

    impl<S: Subscriber> Layer<S> for RecordedFields {
        fn on_record(&self, _span: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            struct Names<'a>(&'a mut Vec<String>);
            impl Visit for Names<'_> {
                fn record_debug(&mut self, field: &Field, _value: &dyn std::fmt::Debug) {
                    self.0.push(field.name().to_string());
                }
            }
            values.record(&mut Names(&mut self.0.lock().unwrap()));
        }
    }

    /// Store against `DATABASE_URL`, or `None` when no database is configured.
    async fn live_store() -> Option<PostgresStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn list_queries_record_row_counts() {
        let recorded = RecordedFields::default();
        let _guard = tracing::subscriber::set_default(Registry::default().with(recorded.clone()));
        let Some(store) = live_store().await else {
            return;
        };

        store.list_files(UploadSessionId::new()).await.unwrap();
        store.list_jobs(AudioBookId::new()).await.unwrap();

        let names = recorded.0.lock().unwrap();
        assert!(names.iter().any(|n| n == "file_count"));
        assert!(names.iter().any(|n| n == "job_count"));
    }

    #[tokio::test]
    async fn audiobook_and_initial_jobs_commit_together() {
        let Some(store) = live_store().await else {
            return;
        };
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
        let job = ProcessingJob::new(book.id, None, JobType::Summarize, json!({}), 3).unwrap();
        assert!(store.create_audiobook(&book, &[], std::slice::from_ref(&job)).await.unwrap());
        assert_eq!(store.list_jobs(book.id).await.unwrap().len(), 1);

        // A clashing job id rolls back the whole step.
        let again = AudioBook::new(
            book.owner,
            None,
            NewAudioBook {
                title: "Again".into(),
                author: None,
                language: None,
                is_public: false,
            },
        )
        .unwrap();
        assert!(matches!(
            store.create_audiobook(&again, &[], &[job]).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(store.get_audiobook(again.id).await.unwrap().is_none());
    }

    #[test]
    fn schema_declares_work_level_uniqueness() {
        assert!(SCHEMA.contains("ON processing_jobs (audiobook_id, job_type) WHERE chapter_id IS NULL"));
    }

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(map_sqlx_error("get_job", sqlx::Error::PoolTimedOut).is_transient());
        assert!(!map_sqlx_error("get_job", sqlx::Error::RowNotFound).is_transient());
    }
}
