//! Upload Tracker: owns an upload session's file set.
//!
//! Progress is always derived from the stored file rows. The only counter is
//! `UploadSession::uploaded_files`, and it moves exclusively through the
//! store's atomic increment.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use narrate_core::{
    BackoffPolicy, FileMetadata, UploadFileStatus, UploadSession, UploadSessionId,
    UploadSessionStatus, UploadedFile, UploadedFileId, UserId,
};

use crate::error::{PipelineError, PipelineResult};
use crate::retry::with_store_retry;
use crate::store::{FileAdmission, PipelineStore, StoreError};

/// Per-file line of a progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub file_id: UploadedFileId,
    pub file_name: String,
    pub size_bytes: u64,
    pub status: UploadFileStatus,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Consistent snapshot of an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub session_id: UploadSessionId,
    pub status: UploadSessionStatus,
    pub uploaded_files: u32,
    pub total_files: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub pending_files: u32,
    pub failed_files: u32,
    pub retrying_files: u32,
    pub files: Vec<FileProgress>,
}

impl UploadProgress {
    fn derive(session: &UploadSession, files: &[UploadedFile]) -> Self {
        let count = |status: UploadFileStatus| -> u32 {
            files.iter().filter(|f| f.status == status).count() as u32
        };
        let uploaded_bytes = files
            .iter()
            .filter(|f| f.status == UploadFileStatus::Uploaded)
            .map(|f| f.metadata.size_bytes)
            .sum();

        Self {
            session_id: session.id,
            status: session.status,
            // Only durably recorded uploads count.
            uploaded_files: count(UploadFileStatus::Uploaded).min(session.total_files),
            total_files: session.total_files,
            uploaded_bytes,
            total_bytes: session.total_bytes,
            pending_files: count(UploadFileStatus::Pending),
            failed_files: count(UploadFileStatus::Failed),
            retrying_files: count(UploadFileStatus::Retrying),
            files: files
                .iter()
                .map(|f| FileProgress {
                    file_id: f.id,
                    file_name: f.metadata.file_name.clone(),
                    size_bytes: f.metadata.size_bytes,
                    status: f.status,
                    retry_count: f.retry_count,
                    error: f.error.clone(),
                })
                .collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == UploadSessionStatus::Completed
    }
}

pub struct UploadTracker {
    store: Arc<dyn PipelineStore>,
    retry: BackoffPolicy,
    max_file_retries: u32,
}

impl UploadTracker {
    pub fn new(store: Arc<dyn PipelineStore>, retry: BackoffPolicy, max_file_retries: u32) -> Self {
        Self {
            store,
            retry,
            max_file_retries,
        }
    }

    #[instrument(skip(self), fields(%owner), err)]
    pub async fn start_session(
        &self,
        owner: UserId,
        total_files: u32,
        total_bytes: u64,
    ) -> PipelineResult<UploadSession> {
        let session = UploadSession::new(owner, total_files, total_bytes)?;
        with_store_retry(&self.retry, "insert_session", || {
            self.store.insert_session(&session)
        })
        .await?;
        info!(session_id = %session.id, total_files, total_bytes, "upload session started");
        Ok(session)
    }

    /// Record a file whose bytes are already durably stored.
    #[instrument(skip(self, metadata), fields(%session_id, file_name = %metadata.file_name), err)]
    pub async fn register_file(
        &self,
        session_id: UploadSessionId,
        metadata: FileMetadata,
    ) -> PipelineResult<UploadedFileId> {
        let file = UploadedFile::uploaded(session_id, metadata, self.max_file_retries)?;
        let session = self.admit(&file).await?;
        self.evaluate_completion(session).await?;
        Ok(file.id)
    }

    /// Record an in-flight file in `pending`.
    #[instrument(skip(self, metadata), fields(%session_id, file_name = %metadata.file_name), err)]
    pub async fn begin_file(
        &self,
        session_id: UploadSessionId,
        metadata: FileMetadata,
    ) -> PipelineResult<UploadedFileId> {
        let file = UploadedFile::pending(session_id, metadata, self.max_file_retries)?;
        let session = self.admit(&file).await?;
        self.ensure_uploading(&session).await?;
        Ok(file.id)
    }

    /// `pending|retrying -> uploaded`. Repeating the call on an uploaded file is a no-op.
    #[instrument(skip(self), fields(%file_id), err)]
    pub async fn complete_file(&self, file_id: UploadedFileId) -> PipelineResult<UploadSession> {
        let file = self.load_file(file_id).await?;
        if file.status == UploadFileStatus::Uploaded {
            debug!(%file_id, "file already uploaded");
            return self.load_session(file.session_id).await;
        }
        file.status.check_transition(UploadFileStatus::Uploaded)?;

        let updated = with_store_retry(&self.retry, "mark_file_uploaded", || {
            self.store.mark_file_uploaded(file_id, file.status)
        })
        .await?;

        let session = match updated {
            Some(session) => session,
            None => {
                let current = self.load_file(file_id).await?;
                if current.status == UploadFileStatus::Uploaded {
                    return self.load_session(file.session_id).await;
                }
                return Err(PipelineError::Conflict(format!(
                    "file {file_id} changed from {} to {} concurrently",
                    file.status, current.status
                )));
            }
        };

        info!(%file_id, session_id = %session.id, uploaded = session.uploaded_files, total = session.total_files, "file uploaded");
        self.evaluate_completion(session).await
    }

    #[instrument(skip(self, reason), fields(%file_id), err)]
    pub async fn mark_failed(
        &self,
        file_id: UploadedFileId,
        reason: impl Into<String>,
    ) -> PipelineResult<UploadedFile> {
        let mut file = self.load_file(file_id).await?;
        let prior = file.status;
        file.mark_failed(reason)?;
        self.write_file(&file, prior).await?;
        warn!(%file_id, session_id = %file.session_id, error = file.error.as_deref().unwrap_or_default(), "file upload failed");
        Ok(file)
    }

    /// `failed -> retrying`, guarded by the retry policy.
    #[instrument(skip(self), fields(%file_id), err)]
    pub async fn retry(&self, file_id: UploadedFileId) -> PipelineResult<UploadedFile> {
        let mut file = self.load_file(file_id).await?;
        let prior = file.status;
        if let Err(err) = file.retry() {
            warn!(%file_id, retry_count = file.retry_count, max_retries = file.max_retries, error = %err, "file retry refused");
            return Err(err.into());
        }
        self.write_file(&file, prior).await?;
        info!(%file_id, retry_count = file.retry_count, "file retry granted");
        Ok(file)
    }

    #[instrument(skip(self), fields(%session_id), err)]
    pub async fn progress(&self, session_id: UploadSessionId) -> PipelineResult<UploadProgress> {
        let session = self.load_session(session_id).await?;
        let files = with_store_retry(&self.retry, "list_files", || {
            self.store.list_files(session_id)
        })
        .await?;
        Ok(UploadProgress::derive(&session, &files))
    }

    async fn admit(&self, file: &UploadedFile) -> PipelineResult<UploadSession> {
        let admission = with_store_retry(&self.retry, "admit_file", || self.store.admit_file(file))
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => {
                    PipelineError::SessionNotFound(file.session_id)
                }
                other => other.into(),
            })?;

        match admission {
            FileAdmission::Admitted(session) => {
                debug!(file_id = %file.id, session_id = %session.id, status = %file.status, "file admitted");
                Ok(session)
            }
            FileAdmission::SessionCompleted(session) => {
                Err(PipelineError::SessionAlreadyCompleted(session.id))
            }
            FileAdmission::SessionFull(session) => Err(PipelineError::invalid_transition(
                "upload session",
                format!("{} with no free file slots ({} total)", session.status, session.total_files),
                "another file",
            )),
        }
    }

    async fn ensure_uploading(&self, session: &UploadSession) -> PipelineResult<()> {
        if session.status != UploadSessionStatus::Pending {
            return Ok(());
        }
        let moved = with_store_retry(&self.retry, "transition_session", || {
            self.store.transition_session(
                session.id,
                UploadSessionStatus::Pending,
                UploadSessionStatus::Uploading,
            )
        })
        .await?;
        if moved {
            info!(session_id = %session.id, "upload session uploading");
        }
        Ok(())
    }

    /// Apply the completion rule against freshly read state.
    async fn evaluate_completion(&self, session: UploadSession) -> PipelineResult<UploadSession> {
        self.ensure_uploading(&session).await?;
        let session = self.load_session(session.id).await?;
        if session.status != UploadSessionStatus::Uploading
            || session.uploaded_files < session.total_files
        {
            return Ok(session);
        }

        let files = with_store_retry(&self.retry, "list_files", || {
            self.store.list_files(session.id)
        })
        .await?;
        if !session.ready_to_complete(&files) {
            debug!(session_id = %session.id, "all files counted but failures unresolved");
            return Ok(session);
        }

        let completed = with_store_retry(&self.retry, "transition_session", || {
            self.store.transition_session(
                session.id,
                UploadSessionStatus::Uploading,
                UploadSessionStatus::Completed,
            )
        })
        .await?;
        if completed {
            info!(session_id = %session.id, files = session.total_files, "upload session completed");
        }
        self.load_session(session.id).await
    }

    async fn write_file(&self, file: &UploadedFile, prior: UploadFileStatus) -> PipelineResult<()> {
        let applied = with_store_retry(&self.retry, "update_file", || {
            self.store.update_file(file, prior)
        })
        .await?;
        if !applied {
            return Err(PipelineError::Conflict(format!(
                "file {} is no longer {prior}",
                file.id
            )));
        }
        Ok(())
    }

    async fn load_session(&self, id: UploadSessionId) -> PipelineResult<UploadSession> {
        with_store_retry(&self.retry, "get_session", || self.store.get_session(id))
            .await?
            .ok_or(PipelineError::SessionNotFound(id))
    }

    async fn load_file(&self, id: UploadedFileId) -> PipelineResult<UploadedFile> {
        with_store_retry(&self.retry, "get_file", || self.store.get_file(id))
            .await?
            .ok_or_else(|| PipelineError::not_found("uploaded file", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use proptest::prelude::*;

    fn tracker(store: Arc<InMemoryStore>) -> UploadTracker {
        UploadTracker::new(store, BackoffPolicy::no_retry(), 2)
    }

    fn meta(name: &str, size: u64) -> FileMetadata {
        FileMetadata {
            file_name: name.into(),
            size_bytes: size,
            mime_type: "audio/mpeg".into(),
            storage_path: format!("uploads/{name}"),
            chapter_number: None,
            chapter_title: None,
        }
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let tracker = tracker(InMemoryStore::arc());
        let missing = UploadSessionId::new();
        assert_eq!(
            tracker.register_file(missing, meta("a.mp3", 1)).await,
            Err(PipelineError::SessionNotFound(missing))
        );
    }

    #[tokio::test]
    async fn first_file_moves_session_to_uploading() {
        let tracker = tracker(InMemoryStore::arc());
        let session = tracker.start_session(UserId::new(), 2, 20).await.unwrap();
        tracker.begin_file(session.id, meta("a.mp3", 10)).await.unwrap();
        let progress = tracker.progress(session.id).await.unwrap();
        assert_eq!(progress.status, UploadSessionStatus::Uploading);
        assert_eq!((progress.uploaded_files, progress.pending_files), (0, 1));
    }

    #[tokio::test]
    async fn completed_session_rejects_files() {
        let tracker = tracker(InMemoryStore::arc());
        let session = tracker.start_session(UserId::new(), 1, 10).await.unwrap();
        tracker.register_file(session.id, meta("a.mp3", 10)).await.unwrap();

        let progress = tracker.progress(session.id).await.unwrap();
        assert!(progress.is_complete());
        assert_eq!(
            tracker.register_file(session.id, meta("b.mp3", 10)).await,
            Err(PipelineError::SessionAlreadyCompleted(session.id))
        );
    }

    #[tokio::test]
    async fn full_session_rejects_extra_files() {
        let tracker = tracker(InMemoryStore::arc());
        let session = tracker.start_session(UserId::new(), 1, 10).await.unwrap();
        tracker.begin_file(session.id, meta("a.mp3", 10)).await.unwrap();
        assert_eq!(
            tracker.begin_file(session.id, meta("b.mp3", 10)).await,
            Err(PipelineError::InvalidTransition {
                entity: "upload session",
                from: "uploading with no free file slots (1 total)".into(),
                to: "another file".into(),
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_respect_total() {
        let total = 4;
        let tracker = Arc::new(tracker(InMemoryStore::arc()));
        let session = tracker.start_session(UserId::new(), total, 0).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for i in 0..total + 3 {
            let tracker = tracker.clone();
            set.spawn(async move {
                tracker
                    .register_file(session.id, meta(&format!("{i}.mp3"), 1))
                    .await
                    .is_ok()
            });
        }
        let mut admitted = 0;
        while let Some(joined) = set.join_next().await {
            if joined.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, total);
        let progress = tracker.progress(session.id).await.unwrap();
        assert_eq!(progress.uploaded_files, total);
        assert_eq!(progress.files.len(), total as usize);
        assert!(progress.is_complete());
    }

    #[tokio::test]
    async fn unresolved_failure_blocks_completion() {
        let tracker = tracker(InMemoryStore::arc());
        let session = tracker.start_session(UserId::new(), 2, 20).await.unwrap();
        tracker.register_file(session.id, meta("a.mp3", 10)).await.unwrap();
        let b = tracker.begin_file(session.id, meta("b.mp3", 10)).await.unwrap();

        tracker.mark_failed(b, "connection reset").await.unwrap();
        let progress = tracker.progress(session.id).await.unwrap();
        assert_eq!(progress.status, UploadSessionStatus::Uploading);
        assert_eq!(progress.failed_files, 1);

        tracker.retry(b).await.unwrap();
        let session = tracker.complete_file(b).await.unwrap();
        assert_eq!(session.status, UploadSessionStatus::Completed);
        assert_eq!(session.uploaded_bytes, 20);
    }

    #[tokio::test]
    async fn retry_bound_is_enforced() {
        let tracker = tracker(InMemoryStore::arc());
        let session = tracker.start_session(UserId::new(), 1, 10).await.unwrap();
        let f = tracker.begin_file(session.id, meta("a.mp3", 10)).await.unwrap();

        for _ in 0..2 {
            tracker.mark_failed(f, "boom").await.unwrap();
            tracker.retry(f).await.unwrap();
        }
        tracker.mark_failed(f, "boom").await.unwrap();
        assert_eq!(
            tracker.retry(f).await,
            Err(PipelineError::RetryExhausted { attempts: 2, max: 2 })
        );

        let progress = tracker.progress(session.id).await.unwrap();
        assert_eq!(progress.files[0].status, UploadFileStatus::Failed);
        assert_eq!(progress.files[0].retry_count, 2);
    }

    #[tokio::test]
    async fn complete_file_is_idempotent() {
        let tracker = tracker(InMemoryStore::arc());
        let session = tracker.start_session(UserId::new(), 2, 20).await.unwrap();
        let f = tracker.begin_file(session.id, meta("a.mp3", 10)).await.unwrap();
        tracker.complete_file(f).await.unwrap();
        let again = tracker.complete_file(f).await.unwrap();
        assert_eq!(again.uploaded_files, 1);
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let store = InMemoryStore::arc();
        let tracker = UploadTracker::new(
            store.clone(),
            BackoffPolicy::fixed(3, std::time::Duration::from_millis(1)),
            3,
        );
        store.fail_next(2);
        assert!(tracker.start_session(UserId::new(), 1, 1).await.is_ok());

        store.fail_next(5);
        assert!(matches!(
            tracker.start_session(UserId::new(), 1, 1).await,
            Err(PipelineError::StorageUnavailable(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn uploaded_count_never_exceeds_total(total in 1u32..6, offered in 0u32..10) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let tracker = tracker(InMemoryStore::arc());
                let session = tracker.start_session(UserId::new(), total, 0).await.unwrap();
                for i in 0..offered {
                    let _ = tracker.register_file(session.id, meta(&format!("{i}.mp3"), 1)).await;
                    let p = tracker.progress(session.id).await.unwrap();
                    assert!(p.uploaded_files <= p.total_files);
                }
                let p = tracker.progress(session.id).await.unwrap();
                assert_eq!(p.uploaded_files, offered.min(total));
                assert_eq!(p.is_complete(), offered >= total);
            });
        }
    }
}
