mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use chatreel::api::{build_router, AppState, JobCreated, JobStatusBody};
use chatreel::jobs::{JobRunner, JobStatus, JobStore};

use common::{harness, harness_with, FakeSpeech, Harness, RecordingEncoder, TableProbe};

fn app(h: &Harness) -> Router {
    build_router(AppState {
        runner: JobRunner::new(JobStore::new(), h.pipeline.clone()),
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn post_json(app: &Router, body: Value) -> (StatusCode, Value) {
    let request = Request::post("/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn wait_for_terminal(app: &Router, job_id: &str) -> Value {
    for _ in 0..250 {
        let (status, body) = get_json(app, &format!("/status/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" || body["status"] == "error" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} did not finish");
}

fn sample_body() -> Value {
    json!({
        "contact_name": "Alice",
        "contact_gender": "female",
        "your_gender": "male",
        "convo": [
            {"sender": "You", "text": "Hi"},
            {"sender": "Alice", "text": "Hey!"},
            {"sender": "You", "text": "What's up"}
        ]
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness(FakeSpeech::default(), TableProbe::default(), RecordingEncoder::default());
    let (status, body) = get_json(&app(&h), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submitted_job_completes_and_downloads() {
    let h = harness(
        FakeSpeech::default(),
        TableProbe::voices(&[1.2, 0.8, 1.5]),
        RecordingEncoder::default(),
    );
    let app = app(&h);

    let (status, body) = post_json(&app, sample_body()).await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["job_id"].as_str().unwrap().to_owned();

    let done = wait_for_terminal(&app, &job_id).await;
    assert_eq!(done["status"], "completed", "{done}");
    assert_eq!(done["progress"], 100);
    assert!(done["error"].is_null());
    assert!(done["video_path"]
        .as_str()
        .unwrap()
        .ends_with(&format!("chat_video_{job_id}.mp4")));

    let created: JobCreated = serde_json::from_value(body.clone()).unwrap();
    assert_eq!(created.job_id.to_string(), job_id);
    let typed: JobStatusBody = serde_json::from_value(done.clone()).unwrap();
    assert_eq!(typed.status, JobStatus::Completed);

    let (status, headers, bytes) = send(
        &app,
        Request::get(format!("/download/{job_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"chat_video_{job_id}.mp4\"").as_str()
    );
    let on_disk = std::fs::read(done["video_path"].as_str().unwrap()).unwrap();
    assert_eq!(bytes, on_disk);
    assert_eq!(
        headers[header::CONTENT_LENGTH],
        on_disk.len().to_string().as_str()
    );
}

#[tokio::test]
async fn failing_job_reports_error_and_has_no_download() {
    let h = harness(
        FakeSpeech::default(),
        TableProbe::voices(&[1.0, 1.0, 1.0]),
        RecordingEncoder {
            fail: true,
            ..RecordingEncoder::default()
        },
    );
    let app = app(&h);

    let (_, body) = post_json(&app, sample_body()).await;
    let job_id = body["job_id"].as_str().unwrap().to_owned();
    let done = wait_for_terminal(&app, &job_id).await;
    assert_eq!(done["status"], "error");
    assert!(done["video_path"].is_null());
    assert!(done["error"].as_str().unwrap().contains("ffmpeg exited"));

    let (status, body) = get_json(&app, &format!("/download/{job_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn empty_conversation_job_ends_with_no_content() {
    let h = harness(FakeSpeech::default(), TableProbe::default(), RecordingEncoder::default());
    let app = app(&h);
    let (status, body) = post_json(&app, json!({"contact_name": "Alice", "convo": []})).await;
    assert_eq!(status, StatusCode::OK);
    let done = wait_for_terminal(&app, body["job_id"].as_str().unwrap()).await;
    assert_eq!(done["status"], "error");
    assert!(done["error"].as_str().unwrap().contains("no content"));
}

#[tokio::test]
async fn malformed_turns_are_rejected() {
    let h = harness(FakeSpeech::default(), TableProbe::default(), RecordingEncoder::default());
    let app = app(&h);

    let (status, body) = post_json(
        &app,
        json!({"contact_name": "Alice", "convo": [{"sender": "You", "text": "   "}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = post_json(&app, json!({"contact_name": "Alice", "convo": [{"text": "hi"}]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(&app, json!({"contact_name": "  ", "convo": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let h = harness(FakeSpeech::default(), TableProbe::default(), RecordingEncoder::default());
    let app = app(&h);

    let (status, _) = get_json(&app, "/status/00000000-0000-0000-0000-000000000000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_json(&app, "/status/not-a-uuid").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_json(&app, "/download/00000000-0000-0000-0000-000000000000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_queue_refuses_new_jobs() {
    let h = harness_with(
        FakeSpeech::default(),
        TableProbe::default(),
        RecordingEncoder::default(),
        |settings| settings.server.max_queued_jobs = 0,
    );
    let (status, body) = post_json(&app(&h), sample_body()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "UNAVAILABLE");
}
