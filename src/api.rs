//! HTTP job API: submit a conversation, poll its job, download the video.

use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationTurn, VoiceSelection};
use crate::dialogue::{DialogueRequest, DEFAULT_MESSAGE_COUNT, DEFAULT_STYLE, MAX_MESSAGE_COUNT};
use crate::jobs::{JobRunner, JobStatus, SubmitError};
use crate::pipeline::{RenderRequest, Script};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub runner: JobRunner,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.runner.pipeline().settings().server.cors_origins);
    Router::new()
        .route("/", get(health))
        .route("/generate", post(generate))
        .route("/status/:job_id", get(status))
        .route("/download/:job_id", get(download))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Body of `POST /generate`. Either `convo` carries the turns, or it is
/// empty and `prompt` asks for a generated dialogue.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateBody {
    pub contact_name: String,
    #[serde(default)]
    pub contact_gender: String,
    #[serde(default)]
    pub your_gender: String,
    #[serde(default)]
    pub convo: Vec<ConversationTurn>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub messages: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusBody {
    pub status: JobStatus,
    pub progress: u8,
    pub video_path: Option<PathBuf>,
    pub error: Option<String>,
}

async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> ApiResult<Json<JobCreated>> {
    let Json(body) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let request = render_request(&state, body)?;

    let job_id = state.runner.submit(request).map_err(|error| match error {
        SubmitError::QueueFull(_) => ApiError::Unavailable(error.to_string()),
    })?;
    Ok(Json(JobCreated { job_id }))
}

fn render_request(state: &AppState, body: GenerateBody) -> ApiResult<RenderRequest> {
    let settings = state.runner.pipeline().settings();
    let contact_name = body.contact_name.trim().to_owned();
    if contact_name.is_empty() {
        return Err(ApiError::BadRequest("contact_name cannot be empty".to_owned()));
    }
    let voices = VoiceSelection::from_genders(&body.your_gender, &body.contact_gender, &settings.speech);

    let prompt = body.prompt.filter(|prompt| !prompt.trim().is_empty());
    let script = match (body.convo.is_empty(), prompt) {
        (true, Some(topic)) => {
            let messages = body.messages.unwrap_or(DEFAULT_MESSAGE_COUNT);
            if messages == 0 || messages > MAX_MESSAGE_COUNT {
                return Err(ApiError::BadRequest(format!(
                    "messages must be within 1..={MAX_MESSAGE_COUNT}"
                )));
            }
            Script::Generate(DialogueRequest {
                contact_name: contact_name.clone(),
                self_name: settings.layout.self_sender.clone(),
                messages,
                style: body.style.unwrap_or_else(|| DEFAULT_STYLE.to_owned()),
                topic: Some(topic),
            })
        }
        _ => Script::Turns(
            Conversation::new(body.convo).map_err(|error| ApiError::BadRequest(error.to_string()))?,
        ),
    };

    Ok(RenderRequest {
        contact_name,
        voices,
        script,
    })
}

fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("job {raw}")))
}

async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusBody>> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .runner
        .store()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
    Ok(Json(JobStatusBody {
        status: job.status,
        progress: job.progress,
        video_path: job.video_path,
        error: job.error,
    }))
}

async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .runner
        .store()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
    let path = match (job.status, job.video_path) {
        (JobStatus::Completed, Some(path)) => path,
        _ => return Err(ApiError::NotFound(format!("video for job {id} is not ready"))),
    };

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        tracing::warn!(job_id = %id, path = %path.display(), error = %error, "completed video missing");
        ApiError::NotFound(format!("video for job {id}"))
    })?;
    let length = file.metadata().await.ok().map(|metadata| metadata.len());

    let disposition = format!("attachment; filename=\"chat_video_{id}.mp4\"");
    let mut response = (
        [
            (header::CONTENT_TYPE, "video/mp4".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();
    if let Some(length) = length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}
