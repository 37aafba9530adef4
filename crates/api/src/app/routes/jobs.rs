use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use narrate_core::JobId;
use narrate_infra::JobStatusReport;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/:id/status", post(report_status))
}

/// Worker callback. Delivery is at-least-once, so repeats answer 200 with
/// `applied: false`.
pub async fn report_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::JobStatusRequest>,
) -> axum::response::Response {
    let job_id: JobId = match errors::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let report = JobStatusReport {
        job_id,
        status: body.status,
        result: body.result,
        error: body.error,
    };
    match services.pipeline.report_job_status(report).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
