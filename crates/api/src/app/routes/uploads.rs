use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use narrate_core::UploadSessionId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(start_upload))
        .route("/:id/files", post(register_file))
        .route("/:id/files/begin", post(begin_file))
        .route("/:id/progress", get(upload_progress))
}

pub async fn start_upload(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::StartUploadRequest>,
) -> axum::response::Response {
    match services
        .pipeline
        .start_upload(body.owner_id, body.total_files, body.total_bytes)
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(dto::session_to_json(&session))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// A file whose bytes are already in durable storage.
pub async fn register_file(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::RegisterFileRequest>,
) -> axum::response::Response {
    let session_id: UploadSessionId = match errors::parse_id(&id, "upload session") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.register_uploaded_file(session_id, body).await {
        Ok(file_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "file_id": file_id.to_string() })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// A file that is still being written; completed later via `/files/:id/complete`.
pub async fn begin_file(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::RegisterFileRequest>,
) -> axum::response::Response {
    let session_id: UploadSessionId = match errors::parse_id(&id, "upload session") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.begin_file(session_id, body).await {
        Ok(file_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "file_id": file_id.to_string() })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn upload_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session_id: UploadSessionId = match errors::parse_id(&id, "upload session") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.upload_progress(session_id).await {
        Ok(progress) => (StatusCode::OK, Json(progress)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
