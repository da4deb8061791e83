//! Telemetry events and the WebSocket stream that carries them.
//!
//! The orchestrator emits one [`TelemetryEvent`] per operation outcome.
//! Events go out on a tokio broadcast channel; sending never blocks and
//! never fails the operation, and events are dropped when nobody listens.
//!
//! Every event serializes as `{"event": "<name>", "payload": {...}}`.
//!
//! ```no_run
//! use tutor_orchestrator::telemetry::{EventBroadcaster, EventMeta, TelemetryEvent};
//!
//! # async fn example() {
//! let broadcaster = EventBroadcaster::new(64);
//! let mut receiver = broadcaster.subscribe();
//!
//! broadcaster.send(TelemetryEvent::hint_budget_exhausted(
//!     EventMeta::new("session-1", "space"),
//!     "m1",
//!     3,
//! ));
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{}", event.event_name());
//! }
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::coach::HintTier;

// ============================================================================
// Event Payloads
// ============================================================================

/// Fields shared by every session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Session the event belongs to.
    pub session_id: String,
    /// Lesson theme.
    pub theme: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    /// Creates event metadata stamped with the current time.
    #[must_use]
    pub fn new(session_id: impl Into<String>, theme: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            theme: theme.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Payload for the `connected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    /// Server version.
    pub version: String,
    /// Clients subscribed, including this one.
    pub subscribers: usize,
    /// When the client connected.
    pub timestamp: DateTime<Utc>,
}

/// Payload for `session_started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Learner display name.
    pub learner_nickname: String,
    /// Lesson difficulty.
    pub difficulty_level: u8,
    /// Number of planned milestones.
    pub total_milestones: usize,
    /// Id of the first active milestone.
    pub first_milestone: Option<String>,
}

/// Payload for `planning_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningFailedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Error code, e.g. `malformed_plan`.
    pub code: String,
    /// Error message.
    pub error: String,
}

/// Payload for `submission_graded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionGradedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Milestone the submission targeted.
    pub milestone_id: String,
    /// Session-wide attempt number.
    pub attempt: u32,
    /// Verdict.
    pub passed: bool,
    /// Xp credited.
    pub xp_awarded: u32,
    /// Whether the conservative verdict was used.
    pub degraded: bool,
}

/// Payload for `milestone_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneCompletedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Completed milestone.
    pub milestone_id: String,
    /// First badge newly earned with this milestone.
    pub badge_earned: Option<String>,
    /// Milestone activated next, if any.
    pub next_milestone: Option<String>,
}

/// Payload for `grading_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingFailedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Milestone being graded.
    pub milestone_id: String,
    /// Why grading fell back to the conservative verdict.
    pub reason: String,
}

/// Payload for `hint_requested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintRequestedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Milestone the hint was for.
    pub milestone_id: String,
    /// Hints served for the milestone, including this one.
    pub hint_count: u32,
    /// Tier of the hint.
    pub tier: HintTier,
}

/// Payload for `hint_budget_exhausted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintBudgetExhaustedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Milestone whose budget ran out.
    pub milestone_id: String,
    /// The budget.
    pub max_hints: u32,
}

/// Payload for `session_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompletedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Total xp.
    pub xp_earned: u32,
    /// Badges earned.
    pub badges_earned: Vec<String>,
    /// Milestones passed.
    pub milestones_completed: usize,
    /// Milestones planned.
    pub total_milestones: usize,
    /// Whether the session was forced to complete.
    pub ended_early: bool,
}

/// Payload for `persistence_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceFailedPayload {
    /// Common fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Operation whose save failed.
    pub operation: String,
    /// Error message.
    pub error: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Telemetry events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Sent to a WebSocket client when it connects.
    Connected(ConnectedPayload),
    /// A session was planned and its first milestone activated.
    SessionStarted(SessionStartedPayload),
    /// Planning failed; the session was not persisted.
    PlanningFailed(PlanningFailedPayload),
    /// A submission was graded.
    SubmissionGraded(SubmissionGradedPayload),
    /// A milestone passed.
    MilestoneCompleted(MilestoneCompletedPayload),
    /// Grading fell back to the conservative verdict.
    GradingFailed(GradingFailedPayload),
    /// A hint was served.
    HintRequested(HintRequestedPayload),
    /// A hint was refused because the budget is spent.
    HintBudgetExhausted(HintBudgetExhaustedPayload),
    /// A session reached `completed`.
    SessionCompleted(SessionCompletedPayload),
    /// A mutation could not be persisted.
    PersistenceFailed(PersistenceFailedPayload),
}

impl TelemetryEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub fn connected(subscribers: usize) -> Self {
        Self::Connected(ConnectedPayload {
            version: env!("CARGO_PKG_VERSION").to_string(),
            subscribers,
            timestamp: Utc::now(),
        })
    }

    /// Creates a `PlanningFailed` event.
    #[must_use]
    pub fn planning_failed(meta: EventMeta, code: &str, error: impl Into<String>) -> Self {
        Self::PlanningFailed(PlanningFailedPayload {
            meta,
            code: code.to_string(),
            error: error.into(),
        })
    }

    /// Creates a `GradingFailed` event.
    #[must_use]
    pub fn grading_failed(
        meta: EventMeta,
        milestone_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::GradingFailed(GradingFailedPayload {
            meta,
            milestone_id: milestone_id.into(),
            reason: reason.into(),
        })
    }

    /// Creates a `HintRequested` event.
    #[must_use]
    pub fn hint_requested(
        meta: EventMeta,
        milestone_id: impl Into<String>,
        hint_count: u32,
        tier: HintTier,
    ) -> Self {
        Self::HintRequested(HintRequestedPayload {
            meta,
            milestone_id: milestone_id.into(),
            hint_count,
            tier,
        })
    }

    /// Creates a `HintBudgetExhausted` event.
    #[must_use]
    pub fn hint_budget_exhausted(
        meta: EventMeta,
        milestone_id: impl Into<String>,
        max_hints: u32,
    ) -> Self {
        Self::HintBudgetExhausted(HintBudgetExhaustedPayload {
            meta,
            milestone_id: milestone_id.into(),
            max_hints,
        })
    }

    /// Creates a `PersistenceFailed` event.
    #[must_use]
    pub fn persistence_failed(
        meta: EventMeta,
        operation: &str,
        error: impl Into<String>,
    ) -> Self {
        Self::PersistenceFailed(PersistenceFailedPayload {
            meta,
            operation: operation.to_string(),
            error: error.into(),
        })
    }

    /// Returns the event name as serialized.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::SessionStarted(_) => "session_started",
            Self::PlanningFailed(_) => "planning_failed",
            Self::SubmissionGraded(_) => "submission_graded",
            Self::MilestoneCompleted(_) => "milestone_completed",
            Self::GradingFailed(_) => "grading_failed",
            Self::HintRequested(_) => "hint_requested",
            Self::HintBudgetExhausted(_) => "hint_budget_exhausted",
            Self::SessionCompleted(_) => "session_completed",
            Self::PersistenceFailed(_) => "persistence_failed",
        }
    }

    /// Session the event belongs to; `None` for `connected`.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        let meta = match self {
            Self::Connected(_) => return None,
            Self::SessionStarted(p) => &p.meta,
            Self::PlanningFailed(p) => &p.meta,
            Self::SubmissionGraded(p) => &p.meta,
            Self::MilestoneCompleted(p) => &p.meta,
            Self::GradingFailed(p) => &p.meta,
            Self::HintRequested(p) => &p.meta,
            Self::HintBudgetExhausted(p) => &p.meta,
            Self::SessionCompleted(p) => &p.meta,
            Self::PersistenceFailed(p) => &p.meta,
        };
        Some(&meta.session_id)
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Fans telemetry events out to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event; returns how many subscribers will see it.
    pub fn send(&self, event: TelemetryEvent) -> usize {
        debug!(
            event = event.event_name(),
            session_id = event.session_id().unwrap_or("-"),
            "Telemetry event"
        );
        // Err only means nobody is subscribed.
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Interval between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// Shared state for the `/ws` route.
#[derive(Debug, Clone)]
pub struct WsState {
    /// Source of events forwarded to clients.
    pub broadcaster: EventBroadcaster,
}

impl WsState {
    /// Creates a `WsState` forwarding from `broadcaster`.
    #[must_use]
    pub const fn new(broadcaster: EventBroadcaster) -> Self {
        Self { broadcaster }
    }
}

/// Upgrades `/ws` requests to a telemetry stream.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> Response {
    info!("New WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before greeting so no event slips between the two.
    let mut events = state.broadcaster.subscribe();

    let connected = TelemetryEvent::connected(state.broadcaster.receiver_count());
    let connected_json = match serde_json::to_string(&connected) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize connected event");
            return;
        }
    };
    if sender.send(Message::Text(connected_json)).await.is_err() {
        debug!("Client disconnected before receiving connected event");
        return;
    }
    info!("WebSocket client connected");

    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested close");
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring message from client");
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize telemetry event");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            debug!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WebSocket client lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    info!(missed = MAX_MISSED_PONGS, "Client stopped answering pings, closing");
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// ============================================================================
// Tests
// ============================================================================
