//! HTTP API for the tutoring engine.
//!
//! # Endpoints
//!
//! - `GET /health` - Completion service and store reachability
//! - `POST /api/sessions/start` - Plan a lesson and start a session
//! - `POST /api/sessions/submit-code` - Grade a submission
//! - `POST /api/sessions/hint` - Request a hint
//! - `GET /api/sessions/:id/progress` - Read-only progress
//! - `POST /api/sessions/:id/complete` - End a session
//! - `GET /api/admin/status` - Operational counters
//! - `GET /ws` - Telemetry event stream
//!
//! Errors are returned as `{"error", "code", "retryable"}` with a status code
//! derived from the error class.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tutor_orchestrator::{create_router, AppState, Config, MemoryStore, Orchestrator, ScriptedCompletionService};
//!
//! # async fn example() {
//! let orchestrator = Orchestrator::new(
//!     Config::default(),
//!     Arc::new(ScriptedCompletionService::new()),
//!     Arc::new(MemoryStore::new()),
//! );
//! let router = create_router(AppState::new(Arc::new(orchestrator)));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await.unwrap();
//! axum::serve(listener, router).await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::error::TutorError;
use crate::orchestrator::{
    GradeOutcome, HealthReport, HintOutcome, Orchestrator, OrchestratorStatus, SessionSummary,
};
use crate::telemetry::{ws_handler, WsState};

// ============================================================================
// Request/Response Types
// ============================================================================

const fn default_difficulty() -> u8 {
    1
}

/// Request body for `POST /api/sessions/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Learner display name.
    pub student_nickname: String,
    /// Lesson theme.
    pub theme: String,
    /// Lesson difficulty; defaults to 1.
    #[serde(default = "default_difficulty")]
    pub difficulty_level: u8,
}

/// Response body for `POST /api/sessions/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    /// Progress of the new session.
    pub summary: SessionSummary,
    /// Welcome message for the learner.
    pub message: String,
}

/// Request body for `POST /api/sessions/submit-code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCodeRequest {
    /// Target session.
    pub session_id: String,
    /// Milestone the code was written for; stale submissions are rejected.
    #[serde(default)]
    pub milestone_id: Option<String>,
    /// The learner's code.
    pub code: String,
    /// Results from the external test runner.
    #[serde(default)]
    pub test_results: serde_json::Value,
}

/// Request body for `POST /api/sessions/hint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintRequest {
    /// Target session.
    pub session_id: String,
    /// Milestone the learner is working on.
    #[serde(default)]
    pub milestone_id: Option<String>,
    /// The learner's code so far.
    #[serde(default)]
    pub current_code: String,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Stable error code.
    pub code: String,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state for the HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The session engine.
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Creates an `AppState` serving `orchestrator`.
    #[must_use]
    pub const fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError(TutorError);

impl From<TutorError> for ApiError {
    fn from(err: TutorError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(TutorError::invalid_request(rejection.body_text()))
    }
}

/// HTTP status for an engine error.
#[must_use]
pub const fn status_for(err: &TutorError) -> StatusCode {
    match err {
        TutorError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        TutorError::InvalidPhase { .. }
        | TutorError::SessionCompleted { .. }
        | TutorError::StaleMilestone { .. } => StatusCode::CONFLICT,
        TutorError::HintBudgetExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
        TutorError::InvalidRequest { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TutorError::PlanningError { .. }
        | TutorError::MalformedPlanError { .. }
        | TutorError::HintGenerationError { .. }
        | TutorError::Completion(_) => StatusCode::BAD_GATEWAY,
        TutorError::PersistenceError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "Request failed");
        }
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            retryable: self.0.is_retryable(),
        });
        (status, body).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router.
///
/// Session routes live under `/api`; `/health` and `/ws` sit at the root.
/// CORS is open and every request is traced.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_routes = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(WsState::new(
            state.orchestrator.telemetry().clone(),
        )));

    let api_routes = Router::new()
        .route("/sessions/start", post(handle_start))
        .route("/sessions/submit-code", post(handle_submit_code))
        .route("/sessions/hint", post(handle_hint))
        .route("/sessions/:id/progress", get(handle_progress))
        .route("/sessions/:id/complete", post(handle_complete))
        .route("/admin/status", get(handle_status));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api", api_routes)
        .with_state(Arc::new(state))
        .merge(ws_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn welcome_message(summary: &SessionSummary) -> String {
    let first = summary
        .active_milestone
        .as_ref()
        .map_or_else(String::new, |m| format!(" First up: {}", m.goal));
    format!(
        "Welcome, {}! Your {} lesson has {} milestones.{first}",
        summary.learner_nickname, summary.theme, summary.total_milestones
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.orchestrator.health().await)
}

async fn handle_start(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StartSessionRequest>, JsonRejection>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let Json(request) = payload?;
    info!(theme = %request.theme, difficulty = request.difficulty_level, "Start session request");

    let summary = state
        .orchestrator
        .start(
            &request.student_nickname,
            &request.theme,
            request.difficulty_level,
        )
        .await?;

    Ok(Json(StartSessionResponse {
        message: welcome_message(&summary),
        summary,
    }))
}

async fn handle_submit_code(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitCodeRequest>, JsonRejection>,
) -> Result<Json<GradeOutcome>, ApiError> {
    let Json(request) = payload?;
    info!(session_id = %request.session_id, code_len = request.code.len(), "Code submission");

    let outcome = state
        .orchestrator
        .submit_for_milestone(
            &request.session_id,
            request.milestone_id.as_deref(),
            &request.code,
            request.test_results,
        )
        .await?;
    Ok(Json(outcome))
}

async fn handle_hint(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<HintRequest>, JsonRejection>,
) -> Result<Json<HintOutcome>, ApiError> {
    let Json(request) = payload?;
    info!(session_id = %request.session_id, "Hint request");

    let outcome = state
        .orchestrator
        .request_hint_for_milestone(
            &request.session_id,
            request.milestone_id.as_deref(),
            &request.current_code,
        )
        .await?;
    Ok(Json(outcome))
}

async fn handle_progress(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.orchestrator.progress(&session_id).await?))
}

async fn handle_complete(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    info!(session_id = %session_id, "Complete session request");
    Ok(Json(state.orchestrator.complete(&session_id).await?))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status())
}

// ============================================================================
// Tests
// ============================================================================
