//! Upload sessions and the files they collect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{AudioBookId, UploadSessionId, UploadedFileId, UserId};
use crate::retry::RetryPolicy;
use crate::status::{UploadFileStatus, UploadSessionStatus};

/// Metadata supplied by the caller for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub storage_path: String,
    /// Absent for single-file uploads.
    #[serde(default)]
    pub chapter_number: Option<u32>,
    #[serde(default)]
    pub chapter_title: Option<String>,
}

impl FileMetadata {
    pub fn validate(&self) -> DomainResult<()> {
        if self.file_name.trim().is_empty() {
            return Err(DomainError::validation("file_name must not be empty"));
        }
        if self.storage_path.trim().is_empty() {
            return Err(DomainError::validation("storage_path must not be empty"));
        }
        if self.mime_type.trim().is_empty() {
            return Err(DomainError::validation("mime_type must not be empty"));
        }
        if self.chapter_number == Some(0) {
            return Err(DomainError::validation("chapter numbers start at 1"));
        }
        Ok(())
    }
}

/// A batch of files uploaded together, later promoted into one audiobook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: UploadSessionId,
    pub owner: UserId,
    pub total_files: u32,
    pub total_bytes: u64,
    pub status: UploadSessionStatus,
    /// Denormalized counter; only ever changed by an atomic store increment.
    pub uploaded_files: u32,
    pub uploaded_bytes: u64,
    /// Set once, when the session is promoted.
    pub audiobook_id: Option<AudioBookId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(owner: UserId, total_files: u32, total_bytes: u64) -> DomainResult<Self> {
        if total_files == 0 {
            return Err(DomainError::validation(
                "an upload session must declare at least one file",
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: UploadSessionId::new(),
            owner,
            total_files,
            total_bytes,
            status: UploadSessionStatus::Pending,
            uploaded_files: 0,
            uploaded_bytes: 0,
            audiobook_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn transition(&mut self, next: UploadSessionStatus) -> DomainResult<()> {
        self.status.check_transition(next)?;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Completion rule: every declared file uploaded and none failed or retrying.
    pub fn ready_to_complete(&self, files: &[UploadedFile]) -> bool {
        self.status == UploadSessionStatus::Uploading
            && self.uploaded_files == self.total_files
            && !files.iter().any(|f| f.status.is_unresolved_failure())
    }
}

impl Entity for UploadSession {
    type Id = UploadSessionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// One file of an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: UploadedFileId,
    pub session_id: UploadSessionId,
    #[serde(flatten)]
    pub metadata: FileMetadata,
    pub status: UploadFileStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadedFile {
    fn with_status(
        session_id: UploadSessionId,
        metadata: FileMetadata,
        max_retries: u32,
        status: UploadFileStatus,
    ) -> DomainResult<Self> {
        metadata.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: UploadedFileId::new(),
            session_id,
            metadata,
            status,
            retry_count: 0,
            max_retries,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// A file whose write is still in flight.
    pub fn pending(
        session_id: UploadSessionId,
        metadata: FileMetadata,
        max_retries: u32,
    ) -> DomainResult<Self> {
        Self::with_status(session_id, metadata, max_retries, UploadFileStatus::Pending)
    }

    /// A file already durably written by the caller.
    pub fn uploaded(
        session_id: UploadSessionId,
        metadata: FileMetadata,
        max_retries: u32,
    ) -> DomainResult<Self> {
        Self::with_status(session_id, metadata, max_retries, UploadFileStatus::Uploaded)
    }

    pub fn transition(&mut self, next: UploadFileStatus) -> DomainResult<()> {
        self.status.check_transition(next)?;
        self.status = next;
        if next == UploadFileStatus::Uploaded {
            self.error = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(UploadFileStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// `failed -> retrying`, guarded by the retry policy.
    ///
    /// On `RetryExhausted` the file is left untouched in `failed`.
    pub fn retry(&mut self) -> DomainResult<u32> {
        self.status.check_transition(UploadFileStatus::Retrying)?;
        let next = RetryPolicy::decide(self.retry_count, self.max_retries).into_result()?;
        self.status = UploadFileStatus::Retrying;
        self.retry_count = next;
        self.updated_at = Utc::now();
        Ok(next)
    }
}

impl Entity for UploadedFile {
    type Id = UploadedFileId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata {
            file_name: name.to_string(),
            size_bytes: 10,
            mime_type: "audio/mpeg".into(),
            storage_path: format!("uploads/{name}"),
            chapter_number: None,
            chapter_title: None,
        }
    }

    #[test]
    fn session_requires_files() {
        assert!(UploadSession::new(UserId::new(), 0, 0).is_err());
    }

    #[test]
    fn metadata_rejects_chapter_zero() {
        let mut m = meta("a.mp3");
        m.chapter_number = Some(0);
        assert!(matches!(m.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn retry_bound_leaves_file_failed() {
        let mut file = UploadedFile::pending(UploadSessionId::new(), meta("a.mp3"), 1).unwrap();
        file.mark_failed("disk full").unwrap();
        assert_eq!(file.retry().unwrap(), 1);
        file.mark_failed("disk full again").unwrap();

        let err = file.retry().unwrap_err();
        assert_eq!(err, DomainError::RetryExhausted { attempts: 1, max: 1 });
        assert_eq!(file.status, UploadFileStatus::Failed);
        assert_eq!(file.retry_count, 1);
    }

    #[test]
    fn retry_requires_failed() {
        let mut file = UploadedFile::uploaded(UploadSessionId::new(), meta("a.mp3"), 3).unwrap();
        assert!(matches!(
            file.retry(),
            Err(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn failed_file_blocks_completion() {
        let mut session = UploadSession::new(UserId::new(), 1, 10).unwrap();
        session.transition(UploadSessionStatus::Uploading).unwrap();
        session.uploaded_files = 1;

        let mut file = UploadedFile::pending(session.id, meta("a.mp3"), 3).unwrap();
        file.mark_failed("boom").unwrap();
        assert!(!session.ready_to_complete(std::slice::from_ref(&file)));

        file.retry().unwrap();
        file.transition(UploadFileStatus::Uploaded).unwrap();
        assert!(session.ready_to_complete(&[file]));
    }
}
