use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/reconcile", post(reconcile))
}

/// Re-dispatch jobs whose enqueue failed and have sat idle past `reconcile_after`.
pub async fn reconcile(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.pipeline.reconcile(Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
