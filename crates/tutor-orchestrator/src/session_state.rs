//! Session state types for the tutoring engine.
//!
//! A [`SessionState`] is the persisted record of one learner's progress
//! through an ordered list of milestones. The orchestrator is its only
//! writer; stages receive read-only views of the fields they need.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};

/// Current snapshot schema version.
pub const STATE_VERSION: u32 = 1;

/// Opaque session identifier.
pub type SessionId = String;

// ============================================================================
// Phase
// ============================================================================

/// Top-level phase of a session.
///
/// Transitions:
/// - `Planning` -> `MilestoneActive` (plan accepted) or `Failed` (planning failed)
/// - `MilestoneActive` -> `AwaitingGrading` (submission received) or `Completed` (forced)
/// - `AwaitingGrading` -> `MilestoneActive` (failed, or passed with more milestones)
///   or `Completed` (passed the last milestone)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The planner has not produced milestones yet.
    #[default]
    Planning,
    /// A milestone is active and accepting hints and submissions.
    MilestoneActive,
    /// A submission is being graded.
    AwaitingGrading,
    /// The session has ended.
    Completed,
    /// Planning failed; never persisted.
    Failed,
}

impl Phase {
    /// Returns `true` if no further events can change the session.
    ///
    /// ```
    /// use tutor_orchestrator::Phase;
    ///
    /// assert!(Phase::Completed.is_terminal());
    /// assert!(Phase::Failed.is_terminal());
    /// assert!(!Phase::MilestoneActive.is_terminal());
    /// ```
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` if a code submission is accepted in this phase.
    #[must_use]
    pub const fn accepts_submission(&self) -> bool {
        matches!(self, Self::MilestoneActive | Self::AwaitingGrading)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planning, Self::MilestoneActive | Self::Failed | Self::Completed)
                | (
                    Self::MilestoneActive,
                    Self::AwaitingGrading | Self::MilestoneActive | Self::Completed
                )
                | (
                    Self::AwaitingGrading,
                    Self::MilestoneActive | Self::AwaitingGrading | Self::Completed
                )
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::MilestoneActive => "milestone_active",
            Self::AwaitingGrading => "awaiting_grading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

// ============================================================================
// Milestones
// ============================================================================

/// Progress of a single milestone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    /// Not reached yet.
    #[default]
    Pending,
    /// Currently being worked on.
    Active,
    /// Passed.
    Completed,
}

/// One learning objective of a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    /// Stable identifier, unique within the lesson.
    pub id: String,
    /// What the learner should achieve.
    pub goal: String,
    /// Code the learner starts from.
    #[serde(default)]
    pub starter_code: String,
    /// Test specification handed to the external test runner.
    #[serde(default, alias = "tests")]
    pub test_spec: serde_json::Value,
    /// Authored hint ladder, easiest first.
    #[serde(default)]
    pub hints: Vec<String>,
}

impl Milestone {
    /// Creates a milestone with only an id and a goal.
    #[must_use]
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            starter_code: String::new(),
            test_spec: serde_json::Value::Null,
            hints: Vec::new(),
        }
    }
}

// ============================================================================
// History
// ============================================================================

/// Record of one graded submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Milestone the submission targeted.
    pub milestone_id: String,
    /// Session-wide attempt number (1-indexed).
    pub attempt: u32,
    /// Whether the verdict passed.
    pub passed: bool,
    /// Xp credited by this attempt.
    pub xp_awarded: u32,
    /// Feedback shown to the learner.
    pub feedback: String,
    /// `true` when grading fell back to the conservative verdict.
    #[serde(default)]
    pub degraded: bool,
    /// When the verdict was applied.
    pub timestamp: DateTime<Utc>,
}

/// Record of one served hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintRecord {
    /// Milestone the hint was for.
    pub milestone_id: String,
    /// Hint number within the milestone (1-indexed).
    pub hint_number: u32,
    /// The hint text.
    pub hint: String,
    /// When the hint was served.
    pub timestamp: DateTime<Utc>,
}

impl HintRecord {
    /// Creates a new `HintRecord` with the current timestamp.
    #[must_use]
    pub fn new(milestone_id: impl Into<String>, hint_number: u32, hint: impl Into<String>) -> Self {
        Self {
            milestone_id: milestone_id.into(),
            hint_number,
            hint: hint.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// SessionState
// ============================================================================

/// Complete persisted state of one tutoring session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Unique id, immutable.
    pub session_id: SessionId,
    /// Learner display name.
    pub learner_nickname: String,
    /// Lesson theme.
    pub theme: String,
    /// Lesson difficulty.
    pub difficulty_level: u8,
    /// Title proposed by the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_title: Option<String>,
    /// Ordered milestones; immutable once planned.
    pub milestones: Vec<Milestone>,
    /// Cursor into `milestones`; equal to the length once every milestone passed.
    pub current_milestone_index: usize,
    /// Status per milestone id.
    pub milestone_status: BTreeMap<String, MilestoneStatus>,
    /// Hints served for the active milestone.
    pub hint_count: u32,
    /// Graded submissions across the session.
    pub attempt_count: u32,
    /// Total xp.
    pub xp_earned: u32,
    /// Earned badge ids in award order, without duplicates.
    pub badges_earned: Vec<String>,
    /// Most recent submitted code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_submitted_code: Option<String>,
    /// Most recent external test results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test_results: Option<serde_json::Value>,
    /// Most recent grading feedback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<String>,
    /// Most recent hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hint: Option<String>,
    /// Current phase.
    pub phase: Phase,
    /// `true` when the session was completed before every milestone passed.
    #[serde(default)]
    pub ended_early: bool,
    /// Graded submissions, oldest first.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Served hints, oldest first.
    #[serde(default)]
    pub hints: Vec<HintRecord>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last mutated.
    pub updated_at: DateTime<Utc>,
    /// When the session completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Creates a new session in the `Planning` phase with a fresh UUID.
    ///
    /// ```
    /// use tutor_orchestrator::{Phase, SessionState};
    ///
    /// let state = SessionState::new("Noa", "football", 1);
    /// assert_eq!(state.phase, Phase::Planning);
    /// assert!(state.milestones.is_empty());
    /// assert_eq!(state.current_milestone_index, 0);
    /// ```
    #[must_use]
    pub fn new(learner_nickname: impl Into<String>, theme: impl Into<String>, difficulty_level: u8) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            learner_nickname: learner_nickname.into(),
            theme: theme.into(),
            difficulty_level,
            lesson_title: None,
            milestones: Vec::new(),
            current_milestone_index: 0,
            milestone_status: BTreeMap::new(),
            hint_count: 0,
            attempt_count: 0,
            xp_earned: 0,
            badges_earned: Vec::new(),
            last_submitted_code: None,
            last_test_results: None,
            last_feedback: None,
            last_hint: None,
            phase: Phase::Planning,
            ended_early: false,
            attempts: Vec::new(),
            hints: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Updates the `updated_at` timestamp to the current time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition_to(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(TutorError::invalid_transition(self.phase, next));
        }
        self.phase = next;
        self.touch();
        Ok(())
    }

    /// Installs the planner's milestones with every status `pending`.
    pub fn set_plan(&mut self, title: Option<String>, milestones: Vec<Milestone>) {
        self.milestone_status = milestones
            .iter()
            .map(|m| (m.id.clone(), MilestoneStatus::Pending))
            .collect();
        self.milestones = milestones;
        self.lesson_title = title;
        self.current_milestone_index = 0;
        self.touch();
    }

    /// The milestone under the cursor, if any remain.
    #[must_use]
    pub fn active_milestone(&self) -> Option<&Milestone> {
        self.milestones.get(self.current_milestone_index)
    }

    /// Status of the milestone with `id`.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<MilestoneStatus> {
        self.milestone_status.get(id).copied()
    }

    /// Moves a milestone's status forward. Statuses never regress.
    pub fn advance_milestone_status(&mut self, id: &str, status: MilestoneStatus) -> Result<()> {
        let current = self
            .milestone_status
            .get_mut(id)
            .ok_or_else(|| TutorError::invariant(format!("unknown milestone '{id}'")))?;
        if status < *current {
            return Err(TutorError::invariant(format!(
                "milestone '{id}' cannot go from {current:?} back to {status:?}"
            )));
        }
        *current = status;
        Ok(())
    }

    /// Credits xp and appends new badges. Returns the first badge not held before.
    pub fn award(&mut self, xp: u32, concepts: &[String]) -> Option<String> {
        self.xp_earned = self.xp_earned.saturating_add(xp);
        let mut first_new = None;
        for concept in concepts {
            let concept = concept.trim();
            if concept.is_empty() || self.badges_earned.iter().any(|b| b == concept) {
                continue;
            }
            self.badges_earned.push(concept.to_string());
            if first_new.is_none() {
                first_new = Some(concept.to_string());
            }
        }
        first_new
    }

    /// Advances the cursor and resets the hint budget.
    pub fn advance_cursor(&mut self) {
        self.current_milestone_index = (self.current_milestone_index + 1).min(self.milestones.len());
        self.hint_count = 0;
    }

    /// Returns `true` once every milestone passed.
    #[must_use]
    pub fn all_milestones_passed(&self) -> bool {
        !self.milestones.is_empty() && self.current_milestone_index >= self.milestones.len()
    }

    /// Number of milestones with status `completed`.
    #[must_use]
    pub fn milestones_completed(&self) -> usize {
        self.milestone_status
            .values()
            .filter(|s| **s == MilestoneStatus::Completed)
            .count()
    }

    /// Hints left for the active milestone.
    #[must_use]
    pub const fn remaining_hints(&self, max_hints: u32) -> u32 {
        max_hints.saturating_sub(self.hint_count)
    }

    /// Appends an attempt record and updates the timestamp.
    pub fn add_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
        self.touch();
    }

    /// Appends a hint record and updates the timestamp.
    pub fn add_hint(&mut self, record: HintRecord) {
        self.hints.push(record);
        self.touch();
    }

    /// Returns the duration since the session was created.
    #[must_use]
    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at.unwrap_or_else(Utc::now) - self.created_at
    }

    /// Checks the structural invariants of a single snapshot.
    pub fn check_invariants(&self, max_hints: u32) -> Result<()> {
        let len = self.milestones.len();

        if self.current_milestone_index > len {
            return Err(TutorError::invariant(format!(
                "cursor {} is past the last milestone ({len})",
                self.current_milestone_index
            )));
        }

        if self.hint_count > max_hints {
            return Err(TutorError::invariant(format!(
                "hint count {} exceeds the budget of {max_hints}",
                self.hint_count
            )));
        }

        if self.milestone_status.len() != len {
            return Err(TutorError::invariant(
                "milestone ids are not unique or statuses are missing",
            ));
        }

        for milestone in &self.milestones {
            if self.status_of(&milestone.id) == Some(MilestoneStatus::Completed)
                && !self
                    .attempts
                    .iter()
                    .any(|a| a.passed && a.milestone_id == milestone.id)
            {
                return Err(TutorError::invariant(format!(
                    "milestone '{}' is completed without a passing grade",
                    milestone.id
                )));
            }
        }

        let reached_end = len > 0 && self.current_milestone_index == len;
        let completed = self.phase == Phase::Completed;
        if reached_end && !completed {
            return Err(TutorError::invariant(format!(
                "every milestone passed but the phase is {}",
                self.phase
            )));
        }
        if completed && !reached_end && !self.ended_early {
            return Err(TutorError::invariant(
                "session is completed with milestones left but was not ended early",
            ));
        }

        Ok(())
    }

    /// Checks that moving from `previous` to `self` only moved forward.
    pub fn check_progression(&self, previous: &Self) -> Result<()> {
        if self.xp_earned < previous.xp_earned {
            return Err(TutorError::invariant(format!(
                "xp decreased from {} to {}",
                previous.xp_earned, self.xp_earned
            )));
        }
        if self.current_milestone_index < previous.current_milestone_index {
            return Err(TutorError::invariant("milestone cursor moved backwards"));
        }
        if self.attempt_count < previous.attempt_count {
            return Err(TutorError::invariant("attempt count decreased"));
        }
        if !self.badges_earned.starts_with(&previous.badges_earned) {
            return Err(TutorError::invariant("earned badges were removed or reordered"));
        }
        for (id, before) in &previous.milestone_status {
            if self.status_of(id).map_or(true, |after| after < *before) {
                return Err(TutorError::invariant(format!(
                    "milestone '{id}' status regressed"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
