use std::sync::Arc;

use narrate_api::app::{router_with, services::AppServices};
use narrate_core::UserId;
use narrate_infra::PipelineConfig;
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over in-memory services, bound to an ephemeral port.
        let services = Arc::new(AppServices::in_memory(PipelineConfig::default()));
        let app = router_with(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (StatusCode, Value) {
    let res = client.post(url).json(&body).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap_or(Value::Null))
}

async fn get(client: &reqwest::Client, url: String) -> (StatusCode, Value) {
    let res = client.get(url).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap_or(Value::Null))
}

fn chapter(n: u32) -> Value {
    json!({
        "file_name": format!("ch{n}.mp3"),
        "size_bytes": 500,
        "mime_type": "audio/mpeg",
        "storage_path": format!("uploads/ch{n}.mp3"),
        "chapter_number": n,
    })
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_promote_and_report_to_completion() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, session) = post(
        &client,
        srv.url("/uploads"),
        json!({ "owner_id": UserId::new(), "total_files": 2, "total_bytes": 1000 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session["id"].as_str().unwrap().to_string();

    let (status, _) = post(&client, srv.url(&format!("/uploads/{session_id}/files")), chapter(1)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, begun) = post(&client, srv.url(&format!("/uploads/{session_id}/files/begin")), chapter(2)).await;
    assert_eq!(status, StatusCode::CREATED);
    let file_id = begun["file_id"].as_str().unwrap().to_string();

    let (status, session) = post(&client, srv.url(&format!("/files/{file_id}/complete")), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "completed");

    let (_, progress) = get(&client, srv.url(&format!("/uploads/{session_id}/progress"))).await;
    assert_eq!(progress["uploaded_files"], 2);
    assert_eq!(progress["total_files"], 2);

    let (status, promotion) = post(
        &client,
        srv.url("/audiobooks"),
        json!({ "upload_session_id": session_id, "title": "The Hobbit", "author": "J. R. R. Tolkien" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let book_id = promotion["audiobook_id"].as_str().unwrap().to_string();
    let transcribe: Vec<String> = promotion["transcribe_jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["job_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(transcribe.len(), 2);

    for job_id in &transcribe {
        let (status, _) = post(
            &client,
            srv.url(&format!("/jobs/{job_id}/status")),
            json!({ "status": "completed", "result": { "content": "In a hole in the ground...", "language": "en" } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, listing) = get(&client, srv.url(&format!("/audiobooks/{book_id}/jobs"))).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = listing["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 4);

    for job in jobs.iter().filter(|j| j["status"] == "pending") {
        let result = if job["job_type"] == "summarize" {
            json!({ "summary": "A hobbit goes there and back again.", "tags": ["fantasy"] })
        } else {
            json!({ "tags": ["fantasy"] })
        };
        let (status, _) = post(
            &client,
            srv.url(&format!("/jobs/{}/status", job["id"].as_str().unwrap())),
            json!({ "status": "completed", "result": result }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, book) = get(&client, srv.url(&format!("/audiobooks/{book_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(book["status"], "completed");
    assert_eq!(book["summary"], "A hobbit goes there and back again.");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = get(&client, srv.url(&format!("/uploads/{}/progress", uuid::Uuid::now_v7()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = get(&client, srv.url("/audiobooks/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let (status, body) = post(
        &client,
        srv.url("/uploads"),
        json!({ "owner_id": UserId::new(), "total_files": 0 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    // Promoting an unfinished session is an invalid transition.
    let (_, session) = post(
        &client,
        srv.url("/uploads"),
        json!({ "owner_id": UserId::new(), "total_files": 1 }),
    )
    .await;
    let (status, body) = post(
        &client,
        srv.url("/audiobooks"),
        json!({ "upload_session_id": session["id"], "title": "Unfinished" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[tokio::test]
async fn exhausted_file_retry_is_unprocessable() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (_, session) = post(
        &client,
        srv.url("/uploads"),
        json!({ "owner_id": UserId::new(), "total_files": 1 }),
    )
    .await;
    let session_id = session["id"].as_str().unwrap().to_string();
    let (_, begun) = post(&client, srv.url(&format!("/uploads/{session_id}/files/begin")), chapter(1)).await;
    let file_id = begun["file_id"].as_str().unwrap().to_string();

    for _ in 0..3 {
        let (status, _) = post(&client, srv.url(&format!("/files/{file_id}/fail")), json!({ "reason": "timeout" })).await;
        assert_eq!(status, StatusCode::OK);
        let (status, file) = post(&client, srv.url(&format!("/files/{file_id}/retry")), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file["status"], "retrying");
    }
    post(&client, srv.url(&format!("/files/{file_id}/fail")), json!({ "reason": "timeout" })).await;
    let (status, body) = post(&client, srv.url(&format!("/files/{file_id}/retry")), json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "retry_exhausted");
}

#[tokio::test]
async fn reconcile_reports_nothing_when_queue_is_healthy() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, report) = post(&client, srv.url("/admin/reconcile"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["examined"], 0);
}
