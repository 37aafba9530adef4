use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use narrate_core::UploadedFileId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:id/complete", post(complete_file))
        .route("/:id/fail", post(fail_file))
        .route("/:id/retry", post(retry_file))
}

pub async fn complete_file(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let file_id: UploadedFileId = match errors::parse_id(&id, "file") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.complete_file(file_id).await {
        Ok(session) => (StatusCode::OK, Json(dto::session_to_json(&session))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn fail_file(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::FailFileRequest>,
) -> axum::response::Response {
    let file_id: UploadedFileId = match errors::parse_id(&id, "file") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.mark_file_failed(file_id, body.reason).await {
        Ok(file) => (StatusCode::OK, Json(dto::file_to_json(&file))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn retry_file(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let file_id: UploadedFileId = match errors::parse_id(&id, "file") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.pipeline.retry_file(file_id).await {
        Ok(file) => (StatusCode::OK, Json(dto::file_to_json(&file))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
