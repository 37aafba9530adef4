use axum::Router;

pub mod admin;
pub mod audiobooks;
pub mod files;
pub mod jobs;
pub mod system;
pub mod uploads;

/// Router for all pipeline endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/uploads", uploads::router())
        .nest("/files", files::router())
        .nest("/audiobooks", audiobooks::router())
        .nest("/jobs", jobs::router())
        .nest("/admin", admin::router())
}
