//! In-memory store for tests and local development.
//!
//! All tables live behind one `RwLock`, so every conditional update and
//! multi-row write is atomic. The lock is never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use narrate_core::{
    AudioBook, AudioBookId, AudioBookStatus, Chapter, ChapterId, ChapterTranscript, Entity, JobId,
    JobStatus, ProcessingJob, UploadFileStatus, UploadSession, UploadSessionId,
    UploadSessionStatus, UploadedFile, UploadedFileId,
};

use super::{CatalogStore, FileAdmission, JobStore, StoreError, UploadStore};

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<UploadSessionId, UploadSession>,
    files: HashMap<UploadedFileId, UploadedFile>,
    audiobooks: HashMap<AudioBookId, AudioBook>,
    chapters: HashMap<ChapterId, Chapter>,
    transcripts: HashMap<ChapterId, ChapterTranscript>,
    jobs: HashMap<JobId, ProcessingJob>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    /// Number of upcoming calls that fail with `Unavailable`.
    injected_outages: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `calls` store calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.injected_outages.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let took = self
            .injected_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.check_available()?;
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.check_available()?;
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

/// Insert or replace a row under its entity id.
fn put<E: Entity + Clone>(table: &mut HashMap<E::Id, E>, row: &E) {
    table.insert(row.id().clone(), row.clone());
}

#[async_trait]
impl UploadStore for InMemoryStore {
    async fn insert_session(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if t.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(format!("upload session {}", session.id)));
        }
        put(&mut t.sessions, session);
        Ok(())
    }

    async fn get_session(&self, id: UploadSessionId) -> Result<Option<UploadSession>, StoreError> {
        Ok(self.read()?.sessions.get(&id).cloned())
    }

    async fn transition_session(
        &self,
        id: UploadSessionId,
        expected: UploadSessionStatus,
        next: UploadSessionStatus,
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let session = t
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("upload session", id))?;
        if session.status != expected {
            return Ok(false);
        }
        session.status = next;
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn admit_file(&self, file: &UploadedFile) -> Result<FileAdmission, StoreError> {
        let mut t = self.write()?;
        let held = t
            .files
            .values()
            .filter(|f| f.session_id == file.session_id)
            .count() as u32;
        if t.files.contains_key(&file.id) {
            return Err(StoreError::Duplicate(format!("uploaded file {}", file.id)));
        }

        let session = t
            .sessions
            .get_mut(&file.session_id)
            .ok_or_else(|| StoreError::not_found("upload session", file.session_id))?;
        if session.status == UploadSessionStatus::Completed {
            return Ok(FileAdmission::SessionCompleted(session.clone()));
        }
        if held >= session.total_files {
            return Ok(FileAdmission::SessionFull(session.clone()));
        }
        if file.status == UploadFileStatus::Uploaded {
            session.uploaded_files += 1;
            session.uploaded_bytes += file.metadata.size_bytes;
            session.updated_at = Utc::now();
        }
        let after = session.clone();
        put(&mut t.files, file);
        Ok(FileAdmission::Admitted(after))
    }

    async fn get_file(&self, id: UploadedFileId) -> Result<Option<UploadedFile>, StoreError> {
        Ok(self.read()?.files.get(&id).cloned())
    }

    async fn list_files(
        &self,
        session_id: UploadSessionId,
    ) -> Result<Vec<UploadedFile>, StoreError> {
        let t = self.read()?;
        let mut files: Vec<_> = t
            .files
            .values()
            .filter(|f| f.session_id == session_id)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }

    async fn mark_file_uploaded(
        &self,
        id: UploadedFileId,
        expected: UploadFileStatus,
    ) -> Result<Option<UploadSession>, StoreError> {
        let mut guard = self.write()?;
        let t = &mut *guard;
        let file = t
            .files
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("uploaded file", id))?;
        if file.status != expected {
            return Ok(None);
        }
        let session = t
            .sessions
            .get_mut(&file.session_id)
            .ok_or_else(|| StoreError::not_found("upload session", file.session_id))?;

        let now = Utc::now();
        file.status = UploadFileStatus::Uploaded;
        file.error = None;
        file.updated_at = now;
        session.uploaded_files += 1;
        session.uploaded_bytes += file.metadata.size_bytes;
        session.updated_at = now;
        Ok(Some(session.clone()))
    }

    async fn update_file(
        &self,
        file: &UploadedFile,
        expected: UploadFileStatus,
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let stored = t
            .files
            .get_mut(&file.id)
            .ok_or_else(|| StoreError::not_found("uploaded file", file.id))?;
        if stored.status != expected {
            return Ok(false);
        }
        stored.status = file.status;
        stored.retry_count = file.retry_count;
        stored.error = file.error.clone();
        stored.updated_at = file.updated_at;
        Ok(true)
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn create_audiobook(
        &self,
        audiobook: &AudioBook,
        chapters: &[Chapter],
        jobs: &[ProcessingJob],
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        if t.audiobooks.contains_key(&audiobook.id) {
            return Err(StoreError::Duplicate(format!("audiobook {}", audiobook.id)));
        }
        if let Some(job) = jobs.iter().find(|j| t.jobs.contains_key(&j.id)) {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }

        if let Some(session_id) = audiobook.source_session_id {
            let session = t
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| StoreError::not_found("upload session", session_id))?;
            if session.status != UploadSessionStatus::Completed || session.audiobook_id.is_some()
            {
                return Ok(false);
            }
            session.audiobook_id = Some(audiobook.id);
            session.updated_at = Utc::now();
        }

        put(&mut t.audiobooks, audiobook);
        for chapter in chapters {
            put(&mut t.chapters, chapter);
        }
        for job in jobs {
            put(&mut t.jobs, job);
        }
        Ok(true)
    }

    async fn get_audiobook(&self, id: AudioBookId) -> Result<Option<AudioBook>, StoreError> {
        Ok(self.read()?.audiobooks.get(&id).cloned())
    }

    async fn transition_audiobook(
        &self,
        id: AudioBookId,
        expected: AudioBookStatus,
        next: AudioBookStatus,
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let book = t
            .audiobooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("audiobook", id))?;
        if book.status != expected {
            return Ok(false);
        }
        book.status = next;
        book.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_summary(&self, id: AudioBookId, summary: &str) -> Result<(), StoreError> {
        let mut t = self.write()?;
        let book = t
            .audiobooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("audiobook", id))?;
        book.summary = Some(summary.to_string());
        book.updated_at = Utc::now();
        Ok(())
    }

    async fn list_chapters(&self, audiobook_id: AudioBookId) -> Result<Vec<Chapter>, StoreError> {
        let t = self.read()?;
        let mut chapters: Vec<_> = t
            .chapters
            .values()
            .filter(|c| c.audiobook_id == audiobook_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.number);
        Ok(chapters)
    }

    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, StoreError> {
        Ok(self.read()?.chapters.get(&id).cloned())
    }

    async fn save_transcript(&self, transcript: &ChapterTranscript) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        if !t.chapters.contains_key(&transcript.chapter_id) {
            return Err(StoreError::not_found("chapter", transcript.chapter_id));
        }
        if t.transcripts.contains_key(&transcript.chapter_id) {
            return Ok(false);
        }
        t.transcripts.insert(transcript.chapter_id, transcript.clone());
        Ok(true)
    }

    async fn get_transcript(
        &self,
        chapter_id: ChapterId,
    ) -> Result<Option<ChapterTranscript>, StoreError> {
        Ok(self.read()?.transcripts.get(&chapter_id).cloned())
    }

    async fn transcribed_chapters(
        &self,
        audiobook_id: AudioBookId,
    ) -> Result<HashSet<ChapterId>, StoreError> {
        let t = self.read()?;
        Ok(t.chapters
            .values()
            .filter(|c| c.audiobook_id == audiobook_id && t.transcripts.contains_key(&c.id))
            .map(|c| c.id)
            .collect())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if t.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }
        if job.chapter_id.is_none() {
            let clash = t.jobs.values().any(|j| {
                j.audiobook_id == job.audiobook_id
                    && j.chapter_id.is_none()
                    && j.job_type == job.job_type
            });
            if clash {
                return Err(StoreError::Duplicate(format!(
                    "{} job for audiobook {}",
                    job.job_type, job.audiobook_id
                )));
            }
        }
        put(&mut t.jobs, job);
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn list_jobs(
        &self,
        audiobook_id: AudioBookId,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        let t = self.read()?;
        let mut jobs: Vec<_> = t
            .jobs
            .values()
            .filter(|j| j.audiobook_id == audiobook_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        Ok(jobs)
    }

    async fn update_job(
        &self,
        job: &ProcessingJob,
        expected: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let stored = t
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::not_found("job", job.id))?;
        if stored.status != expected {
            return Ok(false);
        }
        stored.status = job.status;
        stored.correlation_id = job.correlation_id.clone();
        stored.error = job.error.clone();
        stored.result = job.result.clone();
        stored.retry_count = job.retry_count;
        stored.started_at = job.started_at;
        stored.completed_at = job.completed_at;
        stored.updated_at = job.updated_at;
        Ok(true)
    }

    async fn set_correlation(&self, id: JobId, correlation_id: &str) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let job = t
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if job.correlation_id.is_some() {
            return Ok(false);
        }
        job.correlation_id = Some(correlation_id.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_undispatched(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        let t = self.read()?;
        let mut jobs: Vec<_> = t
            .jobs
            .values()
            .filter(|j| j.is_undispatched() && j.updated_at < older_than)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use narrate_core::{FileMetadata, JobType, NewAudioBook, UserId};
    use serde_json::json;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata {
            file_name: name.into(),
            size_bytes: 100,
            mime_type: "audio/mpeg".into(),
            storage_path: format!("uploads/{name}"),
            chapter_number: None,
            chapter_title: None,
        }
    }

    #[tokio::test]
    async fn admit_file_enforces_declared_count() {
        let store = InMemoryStore::new();
        let session = UploadSession::new(UserId::new(), 1, 100).unwrap();
        store.insert_session(&session).await.unwrap();

        let first = UploadedFile::uploaded(session.id, meta("a.mp3"), 3).unwrap();
        let after = match store.admit_file(&first).await.unwrap() {
            FileAdmission::Admitted(s) => s,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!((after.uploaded_files, after.uploaded_bytes), (1, 100));

        let second = UploadedFile::uploaded(session.id, meta("b.mp3"), 3).unwrap();
        assert!(matches!(
            store.admit_file(&second).await.unwrap(),
            FileAdmission::SessionFull(_)
        ));
    }

    #[tokio::test]
    async fn mark_uploaded_is_conditional() {
        let store = InMemoryStore::new();
        let session = UploadSession::new(UserId::new(), 1, 100).unwrap();
        store.insert_session(&session).await.unwrap();
        let file = UploadedFile::pending(session.id, meta("a.mp3"), 3).unwrap();
        store.admit_file(&file).await.unwrap();

        let updated = store
            .mark_file_uploaded(file.id, UploadFileStatus::Pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.uploaded_files, 1);

        // Second delivery finds the file already uploaded.
        assert!(
            store
                .mark_file_uploaded(file.id, UploadFileStatus::Pending)
                .await
                .unwrap()
                .is_none()
        );
        let session = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.uploaded_files, 1);
    }

    #[tokio::test]
    async fn work_level_jobs_are_unique_per_type() {
        let store = InMemoryStore::new();
        let book = AudioBookId::new();
        let a = ProcessingJob::new(book, None, JobType::Summarize, json!({}), 3).unwrap();
        let b = ProcessingJob::new(book, None, JobType::Summarize, json!({}), 3).unwrap();
        let tag = ProcessingJob::new(book, None, JobType::Tag, json!({}), 3).unwrap();

        store.insert_job(&a).await.unwrap();
        assert!(matches!(store.insert_job(&b).await, Err(StoreError::Duplicate(_))));
        store.insert_job(&tag).await.unwrap();
    }

    #[tokio::test]
    async fn session_can_be_claimed_once() {
        let store = InMemoryStore::new();
        let mut session = UploadSession::new(UserId::new(), 1, 1).unwrap();
        session.status = UploadSessionStatus::Completed;
        store.insert_session(&session).await.unwrap();

        let fields = NewAudioBook {
            title: "Book".into(),
            author: None,
            language: None,
            is_public: false,
        };
        let first = AudioBook::new(session.owner, Some(session.id), fields.clone()).unwrap();
        let second = AudioBook::new(session.owner, Some(session.id), fields).unwrap();
        assert!(store.create_audiobook(&first, &[], &[]).await.unwrap());
        assert!(!store.create_audiobook(&second, &[], &[]).await.unwrap());
        assert!(store.get_audiobook(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_promotion_writes_nothing() {
        let store = InMemoryStore::new();
        let mut session = UploadSession::new(UserId::new(), 1, 1).unwrap();
        session.status = UploadSessionStatus::Completed;
        store.insert_session(&session).await.unwrap();

        let book = AudioBook::new(
            session.owner,
            Some(session.id),
            NewAudioBook {
                title: "Book".into(),
                author: None,
                language: None,
                is_public: false,
            },
        )
        .unwrap();
        let existing = ProcessingJob::new(book.id, None, JobType::Tag, json!({}), 3).unwrap();
        store.insert_job(&existing).await.unwrap();

        assert!(matches!(
            store.create_audiobook(&book, &[], std::slice::from_ref(&existing)).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(store.get_audiobook(book.id).await.unwrap().is_none());
        let session = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.audiobook_id, None);

        let job = ProcessingJob::new(book.id, None, JobType::Summarize, json!({}), 3).unwrap();
        assert!(store.create_audiobook(&book, &[], &[job]).await.unwrap());
        assert_eq!(store.list_jobs(book.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injected_outage_is_transient() {
        let store = InMemoryStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.get_job(JobId::new()).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get_job(JobId::new()).await.unwrap().is_none());
    }
}
