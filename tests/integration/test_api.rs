//! Integration tests for the HTTP API.
//!
//! Each test spawns a real server on an ephemeral port and talks to it with
//! `reqwest`, the way a browser front end would.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tutor_orchestrator::{
    create_router, AppState, CompletionTask, Config, MemoryStore, Orchestrator,
    ScriptedCompletionService,
};

const PLAN: &str = r#"{"title": "Robot Dance", "milestones": [
    {"id": "wave", "goal": "Make the robot wave"},
    {"id": "spin", "goal": "Make the robot spin"}
]}"#;

const PASS: &str = r#"{"success": true, "feedback": "The robot waves!", "xp_awarded": 25, "concepts_learned": ["functions"]}"#;

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    completion: Arc<ScriptedCompletionService>,
    store: Arc<MemoryStore>,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let completion = Arc::new(ScriptedCompletionService::new());
        completion.always(CompletionTask::Planning, PLAN);
        completion.always(CompletionTask::Coaching, "What does a wave look like?");
        completion.always(CompletionTask::Grading, PASS);
        let store = Arc::new(MemoryStore::new());

        let orchestrator = Orchestrator::new(Config::default(), completion.clone(), store.clone());
        let router = create_router(AppState::new(Arc::new(orchestrator)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            completion,
            store,
            _handle: handle,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.expect("Body is not JSON"))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.expect("Body is not JSON"))
    }

    async fn start_session(&self) -> String {
        let (status, body) = self
            .post(
                "/api/sessions/start",
                json!({"studentNickname": "Ari", "theme": "robots", "difficultyLevel": 2}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "start failed: {body}");
        body["summary"]["sessionId"]
            .as_str()
            .expect("sessionId missing")
            .to_string()
    }
}

// ============================================================================
// Session flow
// ============================================================================

#[tokio::test]
async fn test_full_lesson_over_http() {
    let server = TestServer::spawn().await;
    let id = server.start_session().await;

    let (status, hint) = server
        .post(
            "/api/sessions/hint",
            json!({"sessionId": id, "currentCode": "robot."}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hint["hintCount"], 1);
    assert_eq!(hint["hintsRemaining"], 2);

    let (status, graded) = server
        .post(
            "/api/sessions/submit-code",
            json!({"sessionId": id, "milestoneId": "wave", "code": "robot.wave()", "testResults": {"passed": 2}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(graded["passed"], true);
    assert_eq!(graded["xpAwarded"], 25);
    assert_eq!(graded["badgeEarned"], "functions");
    assert_eq!(graded["nextMilestone"]["id"], "spin");

    let (_, graded) = server
        .post(
            "/api/sessions/submit-code",
            json!({"sessionId": id, "code": "robot.spin()"}),
        )
        .await;
    assert_eq!(graded["sessionCompleted"], true);

    let (status, progress) = server.get(&format!("/api/sessions/{id}/progress")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["phase"], "completed");
    assert_eq!(progress["xpEarned"], 50);
    assert_eq!(progress["endedEarly"], false);

    assert_eq!(server.store.len().await, 1);
}

#[tokio::test]
async fn test_stale_milestone_is_conflict() {
    let server = TestServer::spawn().await;
    let id = server.start_session().await;

    let (status, body) = server
        .post(
            "/api/sessions/submit-code",
            json!({"sessionId": id, "milestoneId": "spin", "code": "robot.spin()"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "stale_milestone");
    assert_eq!(server.completion.calls(CompletionTask::Grading), 0);
}

#[tokio::test]
async fn test_hint_budget_is_too_many_requests() {
    let server = TestServer::spawn().await;
    let id = server.start_session().await;

    for _ in 0..3 {
        let (status, _) = server
            .post("/api/sessions/hint", json!({"sessionId": id}))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = server
        .post("/api/sessions/hint", json!({"sessionId": id}))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "hint_budget_exhausted");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_early_completion_over_http() {
    let server = TestServer::spawn().await;
    let id = server.start_session().await;

    let (status, first) = server
        .post(&format!("/api/sessions/{id}/complete"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["endedEarly"], true);

    let (_, second) = server
        .post(&format!("/api/sessions/{id}/complete"), json!({}))
        .await;
    assert_eq!(first, second);

    let (status, body) = server
        .post("/api/sessions/hint", json!({"sessionId": id}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "session_completed");
}

// ============================================================================
// Errors and operations
// ============================================================================

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let server = TestServer::spawn().await;

    let (status, body) = server.get("/api/sessions/does-not-exist/progress").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "session_not_found");
}

#[tokio::test]
async fn test_persistence_outage_is_service_unavailable() {
    let server = TestServer::spawn().await;
    let id = server.start_session().await;
    server.store.fail_saves(true);

    let (status, body) = server
        .post(
            "/api/sessions/submit-code",
            json!({"sessionId": id, "code": "robot.wave()"}),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["retryable"], true);

    let (_, health) = server.get("/health").await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["services"]["store"], "down");
    assert_eq!(health["services"]["completion"], "up");
}

#[tokio::test]
async fn test_admin_status_counts_activity() {
    let server = TestServer::spawn().await;
    let id = server.start_session().await;
    server
        .post(
            "/api/sessions/submit-code",
            json!({"sessionId": id, "code": "robot.wave()"}),
        )
        .await;

    let (status, body) = server.get("/api/admin/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionsStarted"], 1);
    assert_eq!(body["submissionsGraded"], 1);
    assert_eq!(body["milestonesCompleted"], 1);
}
