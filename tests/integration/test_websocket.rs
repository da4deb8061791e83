//! Integration tests for the telemetry WebSocket stream.
//!
//! These tests validate connection handling, event broadcasting and
//! concurrent client support against a real server.

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;
use tutor_orchestrator::{
    create_router, AppState, CompletionTask, Config, MemoryStore, Orchestrator,
    ScriptedCompletionService, TelemetryEvent,
};

const PLAN: &str = r#"{"milestones": [
    {"id": "launch", "goal": "Launch the rocket"},
    {"id": "orbit", "goal": "Reach orbit"}
]}"#;

const PASS: &str = r#"{"success": true, "feedback": "Liftoff!", "xp_awarded": 10, "concepts_learned": ["loops"]}"#;

/// Helper type for WebSocket client
type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawns the test server and returns the orchestrator and WebSocket URL.
async fn spawn_test_server() -> (Arc<Orchestrator>, String, tokio::task::JoinHandle<()>) {
    let completion = Arc::new(ScriptedCompletionService::new());
    completion.always(CompletionTask::Planning, PLAN);
    completion.always(CompletionTask::Coaching, "Count down from ten.");
    completion.always(CompletionTask::Grading, PASS);

    let orchestrator = Arc::new(Orchestrator::new(
        Config::default(),
        completion,
        Arc::new(MemoryStore::new()),
    ));
    let router = create_router(AppState::new(Arc::clone(&orchestrator)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (orchestrator, format!("ws://{addr}/ws"), handle)
}

/// Connects a WebSocket client to the given URL.
async fn connect_client(url: &str) -> WsClient {
    let (ws_stream, _) = connect_async(url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next text message and parses it as a `TelemetryEvent`.
/// Answers ping frames with pong.
async fn receive_event(client: &mut WsClient) -> TelemetryEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {}
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

/// A client receives a connected event first.
#[tokio::test]
async fn test_client_receives_connected_event_on_connect() {
    let (_orchestrator, ws_url, _handle) = spawn_test_server().await;

    let mut client = connect_client(&ws_url).await;
    let event = receive_event(&mut client).await;

    assert!(
        matches!(&event, TelemetryEvent::Connected(p) if p.subscribers >= 1),
        "Expected Connected event, got: {event:?}"
    );
}

/// Multiple clients can connect concurrently.
#[tokio::test]
async fn test_multiple_clients_can_connect() {
    let (orchestrator, ws_url, _handle) = spawn_test_server().await;

    let mut client1 = connect_client(&ws_url).await;
    let mut client2 = connect_client(&ws_url).await;
    let mut client3 = connect_client(&ws_url).await;

    assert!(matches!(receive_event(&mut client1).await, TelemetryEvent::Connected(_)));
    assert!(matches!(receive_event(&mut client2).await, TelemetryEvent::Connected(_)));
    assert!(matches!(receive_event(&mut client3).await, TelemetryEvent::Connected(_)));

    assert_eq!(orchestrator.telemetry().receiver_count(), 3);
}

// ============================================================================
// Event Broadcast Tests
// ============================================================================

/// Session events reach every connected client in order.
#[tokio::test]
async fn test_session_events_broadcast_to_all_clients() {
    let (orchestrator, ws_url, _handle) = spawn_test_server().await;

    let mut client1 = connect_client(&ws_url).await;
    let mut client2 = connect_client(&ws_url).await;
    receive_event(&mut client1).await;
    receive_event(&mut client2).await;

    let summary = orchestrator.start("Kai", "space", 1).await.unwrap();

    for client in [&mut client1, &mut client2] {
        let event = receive_event(client).await;
        assert!(
            matches!(&event, TelemetryEvent::SessionStarted(p)
                if p.meta.session_id == summary.session_id
                    && p.total_milestones == 2
                    && p.first_milestone.as_deref() == Some("launch")),
            "Expected SessionStarted, got: {event:?}"
        );
    }
}

/// A graded pass emits submission and milestone events.
#[tokio::test]
async fn test_submission_events_follow_grading() {
    let (orchestrator, ws_url, _handle) = spawn_test_server().await;
    let summary = orchestrator.start("Kai", "space", 1).await.unwrap();

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await;

    orchestrator
        .request_hint(&summary.session_id, "")
        .await
        .unwrap();
    orchestrator
        .submit(&summary.session_id, "for i in range(10): pass", json!({}))
        .await
        .unwrap();

    let hint = receive_event(&mut client).await;
    assert!(matches!(&hint, TelemetryEvent::HintRequested(p) if p.hint_count == 1));

    let graded = receive_event(&mut client).await;
    assert!(matches!(&graded, TelemetryEvent::SubmissionGraded(p)
        if p.passed && p.xp_awarded == 10 && p.milestone_id == "launch"));

    let milestone = receive_event(&mut client).await;
    assert!(matches!(&milestone, TelemetryEvent::MilestoneCompleted(p)
        if p.badge_earned.as_deref() == Some("loops")
            && p.next_milestone.as_deref() == Some("orbit")));
}

/// Completing a session emits a single completion event.
#[tokio::test]
async fn test_session_completed_event() {
    let (orchestrator, ws_url, _handle) = spawn_test_server().await;
    let summary = orchestrator.start("Kai", "space", 1).await.unwrap();

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await;

    orchestrator.complete(&summary.session_id).await.unwrap();
    orchestrator.complete(&summary.session_id).await.unwrap();

    let event = receive_event(&mut client).await;
    assert!(matches!(&event, TelemetryEvent::SessionCompleted(p)
        if p.ended_early && p.milestones_completed == 0 && p.total_milestones == 2));

    // The repeated completion emits nothing
    let next = timeout(Duration::from_millis(200), client.next()).await;
    assert!(next.is_err(), "Unexpected message: {next:?}");
}

/// Disconnected clients do not block broadcasting.
#[tokio::test]
async fn test_client_disconnect_is_handled() {
    let (orchestrator, ws_url, _handle) = spawn_test_server().await;

    let mut client1 = connect_client(&ws_url).await;
    let mut client2 = connect_client(&ws_url).await;
    receive_event(&mut client1).await;
    receive_event(&mut client2).await;

    client1.close(None).await.expect("Failed to close");
    drop(client1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    orchestrator.start("Kai", "space", 1).await.unwrap();

    let event = receive_event(&mut client2).await;
    assert!(matches!(event, TelemetryEvent::SessionStarted(_)));
}
