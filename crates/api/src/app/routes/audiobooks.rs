use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use narrate_core::{AudioBookId, JobId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_audiobook))
        .route("/:id", get(get_audiobook))
        .route("/:id/jobs", get(list_jobs))
        .route("/:id/retry-all", post(retry_all_failed))
        .route("/:id/jobs/:job_id/retry", post(retry_job))
}

/// Promote a completed upload session into an audiobook.
pub async fn create_audiobook(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateAudiobookRequest>,
) -> axum::response::Response {
    match services
        .pipeline
        .promote_session(body.upload_session_id, body.book)
        .await
    {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_audiobook(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let audiobook_id: AudioBookId = match errors::parse_id(&id, "audiobook") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.audiobook_status(audiobook_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let audiobook_id: AudioBookId = match errors::parse_id(&id, "audiobook") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.audiobook_jobs(audiobook_id).await {
        Ok(jobs) => {
            let jobs: Vec<_> = jobs.iter().map(dto::job_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "jobs": jobs }))).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn retry_all_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let audiobook_id: AudioBookId = match errors::parse_id(&id, "audiobook") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.retry_all_failed_jobs(audiobook_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, job_id)): Path<(String, String)>,
) -> axum::response::Response {
    let audiobook_id: AudioBookId = match errors::parse_id(&id, "audiobook") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let job_id: JobId = match errors::parse_id(&job_id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.retry_job(audiobook_id, job_id).await {
        Ok(outcome) => (StatusCode::OK, Json(dto::dispatch_to_json(&outcome))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
