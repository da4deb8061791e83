//! Milestone Tutor session engine
//!
//! Drives a learner through an ordered list of coding milestones: planning,
//! hints, grading, completion bookkeeping, persistence, the HTTP API and the
//! telemetry stream.

pub mod api;
pub mod coach;
pub mod completion;
pub mod config;
pub mod error;
pub mod grader;
pub mod orchestrator;
pub mod planner;
pub mod projector;
pub mod session_state;
pub mod store;
pub mod telemetry;

pub use api::{
    create_router, AppState, ErrorResponse, HintRequest, StartSessionRequest,
    StartSessionResponse, SubmitCodeRequest,
};
pub use coach::{Coach, HintTier};
pub use completion::{
    ChatMessage, CompletionError, CompletionErrorKind, CompletionMetrics, CompletionRequest,
    CompletionResponse, CompletionService, CompletionTask, HttpCompletionService,
    ScriptedCompletionService,
};
pub use config::Config;
pub use error::{Result, TutorError};
pub use grader::{GradeVerdict, Grader};
pub use orchestrator::{
    GradeOutcome, HealthReport, HealthStatus, HintOutcome, MilestoneView, Orchestrator,
    OrchestratorStatus, ServiceHealth, ServiceStatus, SessionLocks, SessionSummary,
};
pub use planner::{LessonPlan, Planner};
pub use session_state::{
    AttemptRecord, HintRecord, Milestone, MilestoneStatus, Phase, SessionId, SessionState,
    STATE_VERSION,
};
pub use store::{JsonFileStore, MemoryStore, PersistenceStore};
pub use telemetry::{EventBroadcaster, TelemetryEvent};
