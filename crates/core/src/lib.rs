//! `narrate-core`: domain foundation for the audiobook processing pipeline.
//!
//! This crate contains **pure domain** primitives: identifiers, entities, the
//! closed status enums with their transition tables, and the retry policy.
//! Nothing in here performs I/O.

pub mod audiobook;
pub mod entity;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod status;
pub mod upload;

pub use audiobook::{AudioBook, Chapter, ChapterTranscript, NewAudioBook};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AudioBookId, ChapterId, JobId, UploadSessionId, UploadedFileId, UserId};
pub use job::{JobType, ProcessingJob};
pub use retry::{BackoffPolicy, BackoffStrategy, RetryDecision, RetryPolicy};
pub use status::{AudioBookStatus, JobStatus, UploadFileStatus, UploadSessionStatus};
pub use upload::{FileMetadata, UploadSession, UploadedFile};
