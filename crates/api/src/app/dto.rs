use serde::Deserialize;
use serde_json::json;

use narrate_core::{
    FileMetadata, JobStatus, NewAudioBook, ProcessingJob, UploadSession, UploadSessionId,
    UploadedFile, UserId,
};
use narrate_infra::jobs::DispatchOutcome;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StartUploadRequest {
    pub owner_id: UserId,
    pub total_files: u32,
    #[serde(default)]
    pub total_bytes: u64,
}

/// Body of `POST /uploads/:id/files` and `/files/begin`.
pub type RegisterFileRequest = FileMetadata;

#[derive(Debug, Deserialize)]
pub struct FailFileRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAudiobookRequest {
    pub upload_session_id: UploadSessionId,
    #[serde(flatten)]
    pub book: NewAudioBook,
}

#[derive(Debug, Deserialize)]
pub struct JobStatusRequest {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn session_to_json(s: &UploadSession) -> serde_json::Value {
    json!({
        "id": s.id.to_string(),
        "owner_id": s.owner.to_string(),
        "status": s.status.as_str(),
        "total_files": s.total_files,
        "uploaded_files": s.uploaded_files,
        "total_bytes": s.total_bytes,
        "uploaded_bytes": s.uploaded_bytes,
        "audiobook_id": s.audiobook_id.map(|id| id.to_string()),
    })
}

pub fn file_to_json(f: &UploadedFile) -> serde_json::Value {
    json!({
        "id": f.id.to_string(),
        "session_id": f.session_id.to_string(),
        "file_name": f.metadata.file_name,
        "status": f.status.as_str(),
        "retry_count": f.retry_count,
        "max_retries": f.max_retries,
        "error": f.error,
    })
}

pub fn job_to_json(j: &ProcessingJob) -> serde_json::Value {
    json!({
        "id": j.id.to_string(),
        "audiobook_id": j.audiobook_id.to_string(),
        "chapter_id": j.chapter_id.map(|id| id.to_string()),
        "job_type": j.job_type.as_str(),
        "status": j.status.as_str(),
        "correlation_id": j.correlation_id,
        "error": j.error,
        "result": j.result,
        "retry_count": j.retry_count,
        "max_retries": j.max_retries,
        "started_at": j.started_at,
        "completed_at": j.completed_at,
        "created_at": j.created_at,
        "updated_at": j.updated_at,
    })
}

pub fn dispatch_to_json(d: &DispatchOutcome) -> serde_json::Value {
    json!({
        "job_id": d.job_id.to_string(),
        "correlation_id": d.correlation_id.as_ref().map(|c| c.0.clone()),
        "degraded": d.degraded,
    })
}
