//! Milestone Tutor session reports
//!
//! Turns the history of one tutoring session into a [`Report`]: a summary of
//! progress, one row per milestone, and a chronological timeline. Reports
//! serialize to JSON for programmatic use or render to Markdown for learners,
//! parents and teachers.
//!
//! This crate does not depend on the orchestrator. Callers convert their
//! session state into a [`ReportInput`].
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use tutor_report::{MarkdownGenerator, MilestoneInput, MilestoneState, ReportGenerator, ReportInput, ReportPhase};
//! use tutor_report::json::JsonGenerator;
//!
//! let now = Utc::now();
//! let input = ReportInput {
//!     session_id: "abc".to_string(),
//!     learner_nickname: "Noa".to_string(),
//!     theme: "space".to_string(),
//!     lesson_title: None,
//!     difficulty_level: 1,
//!     phase: ReportPhase::MilestoneActive,
//!     ended_early: false,
//!     xp_earned: 0,
//!     badges_earned: vec![],
//!     created_at: now,
//!     updated_at: now,
//!     completed_at: None,
//!     milestones: vec![MilestoneInput {
//!         id: "m1".to_string(),
//!         goal: "Launch the rocket".to_string(),
//!         status: MilestoneState::Active,
//!     }],
//!     attempts: vec![],
//!     hints: vec![],
//! };
//!
//! let report = ReportGenerator::new(&input).generate().unwrap();
//! assert_eq!(report.summary.total_milestones, 1);
//!
//! let markdown = MarkdownGenerator::new(&report).generate();
//! assert!(markdown.contains("Launch the rocket"));
//!
//! let json = JsonGenerator::new(&report).generate_pretty().unwrap();
//! assert!(json.contains("\"session_id\": \"abc\""));
//! ```

pub mod json;
mod markdown;

pub use markdown::MarkdownGenerator;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during report generation.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Failed to serialize the report to JSON.
    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to read or write report files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid report data.
    #[error("invalid report data: {0}")]
    InvalidData(String),
}

/// Result type for report operations.
pub type Result<T> = std::result::Result<T, ReportError>;

// ============================================================================
// Local copies of session types
// ============================================================================

/// Phase of the session when the report was generated.
///
/// Mirrors the orchestrator's phase so this crate stays independent of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPhase {
    /// The lesson is being planned.
    #[default]
    Planning,
    /// A milestone is being worked on.
    MilestoneActive,
    /// A submission is being graded.
    AwaitingGrading,
    /// The session has ended.
    Completed,
    /// Planning failed.
    Failed,
}

impl ReportPhase {
    /// Returns `true` if the session has ended.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Human-readable description.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Planning => "Planning the lesson",
            Self::MilestoneActive => "In progress",
            Self::AwaitingGrading => "Waiting for grading",
            Self::Completed => "Completed",
            Self::Failed => "Planning failed",
        }
    }
}

impl std::fmt::Display for ReportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Status of one milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneState {
    /// Not reached yet.
    #[default]
    Pending,
    /// Being worked on.
    Active,
    /// Passed.
    Completed,
}

impl MilestoneState {
    /// Short label for tables.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "in progress",
            Self::Completed => "passed",
        }
    }
}

// ============================================================================
// Report input
// ============================================================================

/// A planned milestone and its status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneInput {
    /// Milestone id.
    pub id: String,
    /// Milestone goal.
    pub goal: String,
    /// Status at report time.
    pub status: MilestoneState,
}

/// One graded submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptInput {
    /// Milestone the submission targeted.
    pub milestone_id: String,
    /// Session-wide attempt number.
    pub attempt: u32,
    /// Verdict.
    pub passed: bool,
    /// Xp credited.
    pub xp_awarded: u32,
    /// Feedback shown to the learner.
    pub feedback: String,
    /// Whether grading fell back to the conservative verdict.
    pub degraded: bool,
    /// When the verdict was applied.
    pub timestamp: DateTime<Utc>,
}

/// One served hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintInput {
    /// Milestone the hint was for.
    pub milestone_id: String,
    /// Hint number within the milestone.
    pub hint_number: u32,
    /// Hint text.
    pub hint: String,
    /// When the hint was served.
    pub timestamp: DateTime<Utc>,
}

/// Everything the generator needs to know about a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportInput {
    /// Session id.
    pub session_id: String,
    /// Learner display name.
    pub learner_nickname: String,
    /// Lesson theme.
    pub theme: String,
    /// Lesson title.
    pub lesson_title: Option<String>,
    /// Lesson difficulty.
    pub difficulty_level: u8,
    /// Phase at report time.
    pub phase: ReportPhase,
    /// Whether the session was completed before every milestone passed.
    pub ended_early: bool,
    /// Total xp.
    pub xp_earned: u32,
    /// Badges in award order.
    pub badges_earned: Vec<String>,
    /// Session creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Milestones in order.
    pub milestones: Vec<MilestoneInput>,
    /// Graded submissions.
    pub attempts: Vec<AttemptInput>,
    /// Served hints.
    pub hints: Vec<HintInput>,
}

// ============================================================================
// Report
// ============================================================================

/// A complete session report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    /// Session id.
    pub session_id: String,
    /// Learner display name.
    pub learner_nickname: String,
    /// Lesson theme.
    pub theme: String,
    /// Lesson title.
    pub lesson_title: Option<String>,
    /// Headline numbers.
    pub summary: ReportSummary,
    /// One row per milestone, in lesson order.
    pub milestones: Vec<MilestoneReport>,
    /// Events in chronological order.
    pub timeline: Vec<TimelineEntry>,
}

impl Report {
    /// Serializes the report to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(ReportError::from)
    }
}

/// Headline numbers of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Phase at report time.
    pub phase: ReportPhase,
    /// Lesson difficulty.
    pub difficulty_level: u8,
    /// Milestones passed.
    pub milestones_completed: usize,
    /// Milestones planned.
    pub total_milestones: usize,
    /// Total xp.
    pub xp_earned: u32,
    /// Badges in award order.
    pub badges_earned: Vec<String>,
    /// Graded submissions.
    pub attempts: usize,
    /// Passing submissions.
    pub passed_attempts: usize,
    /// Hints served.
    pub hints_used: usize,
    /// Seconds from creation to completion, or to the last update.
    pub duration_seconds: u64,
    /// Whether the session was completed before every milestone passed.
    pub ended_early: bool,
}

impl ReportSummary {
    /// Share of milestones passed, 0 to 100.
    #[must_use]
    pub fn completion_percent(&self) -> u32 {
        if self.total_milestones == 0 {
            return 0;
        }
        let percent = self.milestones_completed * 100 / self.total_milestones;
        u32::try_from(percent).unwrap_or(100)
    }
}

/// Per-milestone row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneReport {
    /// Position in the lesson, 1-indexed.
    pub position: usize,
    /// Milestone id.
    pub id: String,
    /// Milestone goal.
    pub goal: String,
    /// Status at report time.
    pub status: MilestoneState,
    /// Submissions graded for this milestone.
    pub attempts: usize,
    /// Hints served for this milestone.
    pub hints_used: usize,
    /// Xp earned on this milestone.
    pub xp_earned: u32,
    /// When it passed.
    pub passed_at: Option<DateTime<Utc>>,
}

/// A timestamped event in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Milestone the event concerns.
    pub milestone_id: Option<String>,
    /// Short description of the event.
    pub event: String,
    /// Optional additional details about the event.
    pub details: Option<String>,
}

impl TimelineEntry {
    /// Creates a timeline entry.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, event: impl Into<String>) -> Self {
        Self {
            timestamp,
            milestone_id: None,
            event: event.into(),
            details: None,
        }
    }

    /// Attaches the milestone id.
    #[must_use]
    pub fn for_milestone(mut self, milestone_id: impl Into<String>) -> Self {
        self.milestone_id = Some(milestone_id.into());
        self
    }

    /// Attaches details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ============================================================================
// ReportGenerator
// ============================================================================

/// Builds a [`Report`] from a [`ReportInput`].
pub struct ReportGenerator<'a> {
    input: &'a ReportInput,
}

impl<'a> ReportGenerator<'a> {
    /// Creates a generator over `input`.
    #[must_use]
    pub const fn new(input: &'a ReportInput) -> Self {
        Self { input }
    }

    /// Generates the report.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::InvalidData`] if the session id is empty or an
    /// attempt or hint refers to a milestone that is not in the lesson.
    pub fn generate(&self) -> Result<Report> {
        self.validate()?;
        let input = self.input;

        let milestones = self.milestone_rows();
        let summary = ReportSummary {
            phase: input.phase,
            difficulty_level: input.difficulty_level,
            milestones_completed: milestones
                .iter()
                .filter(|m| m.status == MilestoneState::Completed)
                .count(),
            total_milestones: milestones.len(),
            xp_earned: input.xp_earned,
            badges_earned: input.badges_earned.clone(),
            attempts: input.attempts.len(),
            passed_attempts: input.attempts.iter().filter(|a| a.passed).count(),
            hints_used: input.hints.len(),
            duration_seconds: self.duration_seconds(),
            ended_early: input.ended_early,
        };

        Ok(Report {
            session_id: input.session_id.clone(),
            learner_nickname: input.learner_nickname.clone(),
            theme: input.theme.clone(),
            lesson_title: input.lesson_title.clone(),
            summary,
            milestones,
            timeline: self.timeline(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.input.session_id.trim().is_empty() {
            return Err(ReportError::InvalidData("session id is required".to_string()));
        }
        let known: HashSet<&str> = self.input.milestones.iter().map(|m| m.id.as_str()).collect();
        let referenced = self
            .input
            .attempts
            .iter()
            .map(|a| a.milestone_id.as_str())
            .chain(self.input.hints.iter().map(|h| h.milestone_id.as_str()));
        for id in referenced {
            if !known.contains(id) {
                return Err(ReportError::InvalidData(format!(
                    "history refers to unknown milestone '{id}'"
                )));
            }
        }
        Ok(())
    }

    fn milestone_rows(&self) -> Vec<MilestoneReport> {
        self.input
            .milestones
            .iter()
            .enumerate()
            .map(|(index, m)| {
                let attempts: Vec<_> = self
                    .input
                    .attempts
                    .iter()
                    .filter(|a| a.milestone_id == m.id)
                    .collect();
                MilestoneReport {
                    position: index + 1,
                    id: m.id.clone(),
                    goal: m.goal.clone(),
                    status: m.status,
                    attempts: attempts.len(),
                    hints_used: self
                        .input
                        .hints
                        .iter()
                        .filter(|h| h.milestone_id == m.id)
                        .count(),
                    xp_earned: attempts.iter().map(|a| a.xp_awarded).sum(),
                    passed_at: attempts.iter().find(|a| a.passed).map(|a| a.timestamp),
                }
            })
            .collect()
    }

    fn duration_seconds(&self) -> u64 {
        let end = self.input.completed_at.unwrap_or(self.input.updated_at);
        u64::try_from((end - self.input.created_at).num_seconds()).unwrap_or(0)
    }

    fn timeline(&self) -> Vec<TimelineEntry> {
        let input = self.input;
        let mut entries = vec![TimelineEntry::new(input.created_at, "Session started")
            .with_details(format!(
                "{} milestones, difficulty {}",
                input.milestones.len(),
                input.difficulty_level
            ))];

        for hint in &input.hints {
            entries.push(
                TimelineEntry::new(hint.timestamp, format!("Hint {} requested", hint.hint_number))
                    .for_milestone(&hint.milestone_id)
                    .with_details(&hint.hint),
            );
        }

        for attempt in &input.attempts {
            let verdict = if attempt.passed { "passed" } else { "not passed" };
            let mut details = attempt.feedback.clone();
            if attempt.passed {
                details = format!("+{} xp. {details}", attempt.xp_awarded);
            }
            if attempt.degraded {
                details.push_str(" (automatic grading was unavailable)");
            }
            entries.push(
                TimelineEntry::new(
                    attempt.timestamp,
                    format!("Attempt {} {verdict}", attempt.attempt),
                )
                .for_milestone(&attempt.milestone_id)
                .with_details(details),
            );
        }

        if let Some(completed_at) = input.completed_at {
            let event = if input.ended_early {
                "Session ended early"
            } else {
                "Lesson completed"
            };
            entries.push(
                TimelineEntry::new(completed_at, event)
                    .with_details(format!("{} xp earned", input.xp_earned)),
            );
        }

        entries.sort_by_key(|e| e.timestamp);
        entries
    }
}

// ============================================================================
// Tests
// ============================================================================
