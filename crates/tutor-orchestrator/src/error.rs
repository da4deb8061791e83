//! Error types for the tutoring session engine.
//!
//! Errors fall into three groups: validation errors (the event is rejected
//! and nothing changes), fatal-to-operation errors (a stage or the store
//! failed; state is unchanged and the caller may retry), and configuration
//! or I/O errors surfaced while loading settings and snapshots.

use std::path::PathBuf;

use crate::completion::CompletionError;
use crate::session_state::Phase;

/// A specialized `Result` type for tutor operations.
pub type Result<T> = std::result::Result<T, TutorError>;

/// Errors that can occur while driving a tutoring session.
#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your tutor.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Validation Errors (event rejected, no mutation)
    // ========================================================================
    /// No session exists for the given id.
    #[error("Session not found: '{session_id}'\n\nSuggestion: Start a new session or check the session id")]
    SessionNotFound {
        /// The id that was looked up.
        session_id: String,
    },

    /// The session is not in a phase that accepts this event.
    #[error("Cannot {operation} session '{session_id}' while it is {phase}")]
    InvalidPhase {
        /// The session id.
        session_id: String,
        /// The phase the session was in.
        phase: Phase,
        /// The rejected operation.
        operation: String,
    },

    /// The session has already completed.
    #[error("Session '{session_id}' is already completed\n\nSuggestion: Start a new session to keep learning")]
    SessionCompleted {
        /// The session id.
        session_id: String,
    },

    /// The hint budget for the active milestone is spent.
    #[error("No hints left for this milestone (limit {max_hints})\n\nSuggestion: Submit an attempt to unlock the next milestone")]
    HintBudgetExhausted {
        /// The session id.
        session_id: String,
        /// The configured per-milestone maximum.
        max_hints: u32,
    },

    /// A submission or hint request targeted a milestone that is no longer active.
    #[error("Milestone '{requested}' is not active (active milestone: {active})")]
    StaleMilestone {
        /// The milestone id in the request.
        requested: String,
        /// The milestone id that is currently active.
        active: String,
    },

    /// The request parameters are invalid.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    // ========================================================================
    // Stage Errors (fatal to the operation, retry safe)
    // ========================================================================
    /// The planner could not produce any milestone.
    #[error("Lesson planning failed: {message}\n\nSuggestion: Retry; the completion service may be unavailable")]
    PlanningError {
        /// Description of the failure.
        message: String,
    },

    /// The planner response could not be parsed into milestones.
    #[error("Lesson plan could not be parsed: {message}\n\nSuggestion: Retry; the model returned an unexpected format")]
    MalformedPlanError {
        /// Description of the parse failure.
        message: String,
    },

    /// The coach could not produce a hint.
    #[error("Hint generation failed: {message}\n\nSuggestion: Retry the hint request; no hint was consumed")]
    HintGenerationError {
        /// Description of the failure.
        message: String,
    },

    /// The persistence store rejected a save or load.
    #[error("Persistence failed: {message}\n\nSuggestion: Check the session store and retry")]
    PersistenceError {
        /// Description of the failure.
        message: String,
    },

    /// A completion call failed outside of a stage.
    #[error(transparent)]
    Completion(#[from] CompletionError),

    // ========================================================================
    // State Persistence Errors
    // ========================================================================
    /// Session snapshot contains malformed JSON or an unknown version.
    #[error("Corrupted session file '{path}': {message}\n\nSuggestion: Remove the file or restore it from a backup")]
    StateFileCorrupted {
        /// Path to the corrupted snapshot.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // State Machine Errors
    // ========================================================================
    /// Invalid phase transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current phase.
        from: String,
        /// The attempted target phase.
        to: String,
    },

    /// A transition produced a state that breaks a session invariant.
    #[error("Session invariant violated: {message}")]
    InvariantViolation {
        /// Which invariant failed.
        message: String,
    },
}

impl TutorError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `SessionNotFound` error.
    #[must_use]
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates a new `InvalidPhase` error.
    #[must_use]
    pub fn invalid_phase(
        session_id: impl Into<String>,
        phase: Phase,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidPhase {
            session_id: session_id.into(),
            phase,
            operation: operation.into(),
        }
    }

    /// Creates a new `SessionCompleted` error.
    #[must_use]
    pub fn session_completed(session_id: impl Into<String>) -> Self {
        Self::SessionCompleted {
            session_id: session_id.into(),
        }
    }

    /// Creates a new `HintBudgetExhausted` error.
    #[must_use]
    pub fn hint_budget_exhausted(session_id: impl Into<String>, max_hints: u32) -> Self {
        Self::HintBudgetExhausted {
            session_id: session_id.into(),
            max_hints,
        }
    }

    /// Creates a new `StaleMilestone` error.
    #[must_use]
    pub fn stale_milestone(requested: impl Into<String>, active: impl Into<String>) -> Self {
        Self::StaleMilestone {
            requested: requested.into(),
            active: active.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `PlanningError`.
    #[must_use]
    pub fn planning(message: impl Into<String>) -> Self {
        Self::PlanningError {
            message: message.into(),
        }
    }

    /// Creates a new `MalformedPlanError`.
    #[must_use]
    pub fn malformed_plan(message: impl Into<String>) -> Self {
        Self::MalformedPlanError {
            message: message.into(),
        }
    }

    /// Creates a new `HintGenerationError`.
    #[must_use]
    pub fn hint_generation(message: impl Into<String>) -> Self {
        Self::HintGenerationError {
            message: message.into(),
        }
    }

    /// Creates a new `PersistenceError`.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceError {
            message: message.into(),
        }
    }

    /// Creates a new `StateFileCorrupted` error.
    #[must_use]
    pub fn state_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StateFileCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a new `InvariantViolation` error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Returns `true` if the operation failed without mutating state and may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::PlanningError { .. }
            | Self::MalformedPlanError { .. }
            | Self::HintGenerationError { .. }
            | Self::PersistenceError { .. } => true,
            Self::Completion(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if the event was rejected because of the session's state or the request.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. }
                | Self::InvalidPhase { .. }
                | Self::SessionCompleted { .. }
                | Self::HintBudgetExhausted { .. }
                | Self::StaleMilestone { .. }
                | Self::InvalidRequest { .. }
        )
    }

    /// Short machine-readable code for API responses and telemetry.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigParseError { .. } => "config_parse",
            Self::ConfigValidationError { .. } => "config_validation",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::InvalidPhase { .. } => "invalid_phase",
            Self::SessionCompleted { .. } => "session_completed",
            Self::HintBudgetExhausted { .. } => "hint_budget_exhausted",
            Self::StaleMilestone { .. } => "stale_milestone",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::PlanningError { .. } => "planning_failed",
            Self::MalformedPlanError { .. } => "malformed_plan",
            Self::HintGenerationError { .. } => "hint_generation_failed",
            Self::PersistenceError { .. } => "persistence_failed",
            Self::Completion(_) => "completion_failed",
            Self::StateFileCorrupted { .. } => "state_corrupted",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::InvalidStateTransition { .. } => "invalid_transition",
            Self::InvariantViolation { .. } => "invariant_violation",
        }
    }
}
