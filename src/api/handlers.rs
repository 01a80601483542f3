//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    CameraDeniedRequest, ChatRequest, CreateSessionRequest, CreateSessionResponse, ErrorResponse,
    FrameRequest, ModeRequest, QueuedResponse, SessionResponse, SuccessResponse,
};
use super::AppState;
use crate::camera::StillImage;
use crate::runtime::{snapshot_json, SessionError, SessionUpdate};
use crate::state_machine::state::CAMERA_DENIED_REASON;
use crate::state_machine::Event;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Session lifecycle
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        // SSE streaming
        .route("/api/sessions/:id/stream", get(stream_session))
        // User actions
        .route("/api/sessions/:id/mode", post(select_mode))
        .route("/api/sessions/:id/start", post(start))
        .route("/api/sessions/:id/capture", post(capture))
        .route("/api/sessions/:id/retry", post(retry_capture))
        .route("/api/sessions/:id/cancel", post(cancel_capture))
        .route("/api/sessions/:id/next", post(next_match))
        .route("/api/sessions/:id/stop", post(stop))
        .route("/api/sessions/:id/messages", post(send_message))
        // Camera relay
        .route("/api/sessions/:id/camera/frame", post(push_frame))
        .route("/api/sessions/:id/camera/denied", post(camera_denied))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Session Lifecycle
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> (StatusCode, Json<CreateSessionResponse>) {
    let Json(req) = body.unwrap_or_default();
    let handle = state.sessions.create(req.mode).await;
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            state: snapshot_json(&handle.snapshot()),
            id: handle.id,
        }),
    )
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let handle = state.sessions.get(&id).await?;
    Ok(Json(SessionResponse {
        state: snapshot_json(&handle.snapshot()),
        id,
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.sessions.remove(&id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(&id).await?;

    // Subscribe before reading the snapshot so no update falls in between
    let broadcast_rx = handle.subscribe();
    let init = SessionUpdate::StateChange {
        state: snapshot_json(&handle.snapshot()),
    };

    Ok(sse_stream(init, broadcast_rx))
}

// ============================================================
// User Actions
// ============================================================

/// Queue an event; the outcome arrives on the session stream
async fn queue(state: &AppState, id: &str, event: Event) -> Result<Json<QueuedResponse>, AppError> {
    state.sessions.send_event(id, event).await?;
    Ok(Json(QueuedResponse { queued: true }))
}

async fn select_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ModeRequest>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::SelectMode { mode: req.mode }).await
}

async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::Start).await
}

async fn capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::Capture).await
}

async fn retry_capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::RetryCapture).await
}

async fn cancel_capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::CancelCapture).await
}

async fn next_match(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::Next).await
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::Stop).await
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<QueuedResponse>, AppError> {
    let event = Event::UserMessage {
        text: req.text,
        message_id: uuid::Uuid::new_v4().to_string(),
        sent_at: Utc::now(),
    };
    queue(&state, &id, event).await
}

// ============================================================
// Camera Relay
// ============================================================

async fn push_frame(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FrameRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    if !req.data_uri.starts_with("data:image/") {
        return Err(AppError::BadRequest(
            "Frame must be an image data URI".to_string(),
        ));
    }
    let handle = state.sessions.get(&id).await?;
    handle.camera().push_frame(StillImage::new(req.data_uri));
    Ok(Json(SuccessResponse { success: true }))
}

async fn camera_denied(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CameraDeniedRequest>>,
) -> Result<Json<SuccessResponse>, AppError> {
    let Json(req) = body.unwrap_or_default();
    let handle = state.sessions.get(&id).await?;
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| CAMERA_DENIED_REASON.to_string());
    tracing::info!(session_id = %id, %reason, "Client reported camera denied");
    handle.camera().deny(reason);
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_version() -> &'static str {
    concat!("rendezvous ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Gone(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => AppError::NotFound(e.to_string()),
            SessionError::Closed => AppError::Gone(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Gone(msg) => (StatusCode::GONE, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
