use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::errors::EngineError;
use crate::session::{CreateSessionRequest, WorkSessionEngine};

/// Seconds a client should wait before retrying a collaborator failure.
const RETRY_AFTER_SECS: &str = "5";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: WorkSessionEngine,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PromptRequest {
    pub stage: String,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Deserialize)]
pub struct SnapshotRequest {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::SessionNotFound { .. }
            | EngineError::StageNotFound { .. }
            | EngineError::EvidencePackNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Schema { .. } | EngineError::Upstream(_) => StatusCode::BAD_GATEWAY,
            EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && !err.is_retryable() {
            tracing::error!(error = %error_chain(&err), kind = err.kind(), "Request failed");
        }

        let body = Json(serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "retryable": err.is_retryable(),
        }));
        let mut response = (status, body).into_response();
        if err.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

/// The error message followed by its source chain.
fn error_chain(err: &EngineError) -> String {
    let mut out = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/prompt", post(next_prompt))
        .route("/api/sessions/{id}/snapshots", post(record_snapshot))
        .route("/api/sessions/{id}/complete", post(complete_session))
        .route("/api/share/{share_id}", get(get_shared_pack))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.engine.create_session(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.engine.session_view(&id).await?;
    Ok(Json(view))
}

async fn next_prompt(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = state.engine.next_prompt(&id, &req.stage, req.response).await?;
    Ok(Json(turn))
}

async fn record_snapshot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .engine
        .record_code_snapshot(&id, req.code, req.language)
        .await?;
    let status = if outcome.recorded {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn complete_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let completed = state.engine.complete_session(&id).await?;
    Ok((StatusCode::CREATED, Json(completed)))
}

async fn get_shared_pack(
    State(state): State<SharedState>,
    Path(share_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pack = state.engine.evidence_pack_by_share_id(&share_id).await?;
    Ok(Json(pack))
}
