use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use narrate_infra::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        PipelineError::SessionNotFound(_) | PipelineError::NotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "not_found", message)
        }
        PipelineError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        PipelineError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", message)
        }
        PipelineError::SessionAlreadyCompleted(_) => {
            json_error(StatusCode::CONFLICT, "session_completed", message)
        }
        PipelineError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        PipelineError::RetryExhausted { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "retry_exhausted", message)
        }
        PipelineError::StorageUnavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", message)
        }
        PipelineError::Storage(_) => {
            tracing::error!(error = %message, "storage error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path id, answering 400 on malformed input.
pub fn parse_id<T: FromStr>(raw: &str, what: &'static str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use narrate_core::UploadSessionId;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        let cases = [
            (PipelineError::SessionNotFound(UploadSessionId::new()), StatusCode::NOT_FOUND),
            (PipelineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (PipelineError::invalid_transition("job", "completed", "failed"), StatusCode::CONFLICT),
            (PipelineError::SessionAlreadyCompleted(UploadSessionId::new()), StatusCode::CONFLICT),
            (PipelineError::Conflict("raced".into()), StatusCode::CONFLICT),
            (PipelineError::RetryExhausted { attempts: 3, max: 3 }, StatusCode::UNPROCESSABLE_ENTITY),
            (PipelineError::StorageUnavailable("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::Storage("corrupt".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(pipeline_error_to_response(err).status(), status);
        }
    }

    #[test]
    fn malformed_ids_are_bad_requests() {
        let err = parse_id::<UploadSessionId>("nope", "upload session").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
