//! The session state machine driver.
//!
//! The [`Orchestrator`] is the only writer of [`SessionState`]. Each
//! operation takes the per-session lock, loads a copy of the state, invokes
//! exactly the stages it needs, validates the result, persists it, and only
//! then reports success. A failure anywhere before the save leaves the stored
//! snapshot untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::coach::{Coach, HintTier};
use crate::completion::{CompletionMetrics, CompletionService};
use crate::config::Config;
use crate::error::{Result, TutorError};
use crate::grader::Grader;
use crate::planner::Planner;
use crate::projector;
use crate::session_state::{
    AttemptRecord, HintRecord, Milestone, MilestoneStatus, Phase, SessionId, SessionState,
};
use crate::store::PersistenceStore;
use crate::telemetry::{
    EventBroadcaster, EventMeta, MilestoneCompletedPayload, SessionCompletedPayload,
    SessionStartedPayload, SubmissionGradedPayload, TelemetryEvent,
};

// ============================================================================
// Session locks
// ============================================================================

/// Registry of per-session async mutexes.
///
/// Entries are created on first use and pruned when the last holder or
/// waiter releases them.
#[derive(Debug, Default)]
pub struct SessionLocks {
    entries: std::sync::Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one session; released on drop.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    registry: &'a SessionLocks,
    session_id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard<'_> {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(session_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            registry: self,
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of sessions currently locked or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no session is locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut entries = self
            .registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            entries.remove(&self.session_id);
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Learner-facing view of a milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneView {
    /// Milestone id.
    pub id: String,
    /// What the learner should achieve.
    pub goal: String,
    /// Code the learner starts from.
    pub starter_code: String,
    /// Test specification for the external runner.
    pub test_spec: serde_json::Value,
}

impl From<&Milestone> for MilestoneView {
    fn from(m: &Milestone) -> Self {
        Self {
            id: m.id.clone(),
            goal: m.goal.clone(),
            starter_code: m.starter_code.clone(),
            test_spec: m.test_spec.clone(),
        }
    }
}

/// Progress snapshot returned by most operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub session_id: SessionId,
    /// Learner display name.
    pub learner_nickname: String,
    /// Lesson theme.
    pub theme: String,
    /// Lesson title from the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_title: Option<String>,
    /// Cursor position; equals `total_milestones` when every milestone passed.
    pub current_milestone: usize,
    /// Planned milestones.
    pub total_milestones: usize,
    /// Total xp.
    pub xp_earned: u32,
    /// Badges in award order.
    pub badges_earned: Vec<String>,
    /// Current phase.
    pub phase: Phase,
    /// The milestone being worked on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_milestone: Option<MilestoneView>,
    /// Hints served for the active milestone.
    pub hint_count: u32,
    /// Graded submissions so far.
    pub attempt_count: u32,
    /// Whether the session was completed before every milestone passed.
    pub ended_early: bool,
}

impl From<&SessionState> for SessionSummary {
    fn from(state: &SessionState) -> Self {
        let active_milestone = if state.phase == Phase::Completed {
            None
        } else {
            state.active_milestone().map(MilestoneView::from)
        };
        Self {
            session_id: state.session_id.clone(),
            learner_nickname: state.learner_nickname.clone(),
            theme: state.theme.clone(),
            lesson_title: state.lesson_title.clone(),
            current_milestone: state.current_milestone_index,
            total_milestones: state.milestones.len(),
            xp_earned: state.xp_earned,
            badges_earned: state.badges_earned.clone(),
            phase: state.phase,
            active_milestone,
            hint_count: state.hint_count,
            attempt_count: state.attempt_count,
            ended_early: state.ended_early,
        }
    }
}

/// Result of a graded submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOutcome {
    /// Whether the milestone passed.
    pub passed: bool,
    /// Feedback for the learner.
    pub feedback: String,
    /// Xp credited by this submission.
    pub xp_awarded: u32,
    /// First badge newly earned by this submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge_earned: Option<String>,
    /// Milestone activated after a pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_milestone: Option<MilestoneView>,
    /// Whether this submission finished the lesson.
    pub session_completed: bool,
    /// Whether grading fell back to the conservative verdict.
    pub degraded: bool,
    /// Session progress after the submission.
    pub summary: SessionSummary,
}

/// Result of a hint request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintOutcome {
    /// The hint.
    pub hint: String,
    /// Hints served for the milestone, including this one.
    pub hint_count: u32,
    /// Tier the hint was generated at.
    pub tier: HintTier,
    /// Hints left for the milestone.
    pub hints_remaining: u32,
    /// Whether this was the last hint of the budget.
    pub budget_exhausted: bool,
}

/// Reachability of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Reachable.
    Up,
    /// Unreachable.
    Down,
}

impl From<bool> for ServiceStatus {
    fn from(up: bool) -> Self {
        if up {
            Self::Up
        } else {
            Self::Down
        }
    }
}

/// Dependency status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Completion service.
    pub completion: ServiceStatus,
    /// Session store.
    pub store: ServiceStatus,
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every dependency is up.
    Healthy,
    /// At least one dependency is down.
    Degraded,
}

/// Result of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Per-dependency status.
    pub services: ServiceHealth,
}

/// Operational counters since start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    /// When the orchestrator was created.
    pub started_at: DateTime<Utc>,
    /// Sessions planned and persisted.
    pub sessions_started: u64,
    /// Starts rejected by the planner.
    pub planning_failures: u64,
    /// Submissions graded and persisted.
    pub submissions_graded: u64,
    /// Submissions graded with the conservative verdict.
    pub degraded_gradings: u64,
    /// Milestones passed.
    pub milestones_completed: u64,
    /// Hints served.
    pub hints_served: u64,
    /// Sessions that reached `completed`.
    pub sessions_completed: u64,
    /// Saves that failed.
    pub persistence_failures: u64,
    /// Sessions currently locked by an operation.
    pub active_operations: usize,
    /// Connected telemetry subscribers.
    pub telemetry_subscribers: usize,
    /// Completion adapter counters.
    pub completion: CompletionMetrics,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_started: AtomicU64,
    planning_failures: AtomicU64,
    submissions_graded: AtomicU64,
    degraded_gradings: AtomicU64,
    milestones_completed: AtomicU64,
    hints_served: AtomicU64,
    sessions_completed: AtomicU64,
    persistence_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives sessions through planning, hints, grading and completion.
pub struct Orchestrator {
    config: Config,
    planner: Planner,
    coach: Coach,
    grader: Grader,
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn PersistenceStore>,
    telemetry: EventBroadcaster,
    locks: SessionLocks,
    counters: Counters,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over the given services.
    #[must_use]
    pub fn new(
        config: Config,
        completion: Arc<dyn CompletionService>,
        store: Arc<dyn PersistenceStore>,
    ) -> Self {
        Self {
            planner: Planner::new(Arc::clone(&completion)),
            coach: Coach::new(Arc::clone(&completion)),
            grader: Grader::new(Arc::clone(&completion), config.grading.max_xp_per_milestone),
            telemetry: EventBroadcaster::new(config.telemetry.channel_capacity),
            completion,
            store,
            locks: SessionLocks::new(),
            counters: Counters::default(),
            started_at: Utc::now(),
            config,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The telemetry stream.
    #[must_use]
    pub const fn telemetry(&self) -> &EventBroadcaster {
        &self.telemetry
    }

    /// The session store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn PersistenceStore> {
        Arc::clone(&self.store)
    }

    // ------------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------------

    /// Plans a new lesson and activates its first milestone.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for a blank or too long nickname, an unknown theme,
    ///   or a difficulty outside the configured range
    /// - `PlanningError` / `MalformedPlanError` from the planner; nothing is
    ///   persisted in that case
    /// - `PersistenceError` if the new session cannot be saved
    pub async fn start(
        &self,
        learner_nickname: &str,
        theme: &str,
        difficulty_level: u8,
    ) -> Result<SessionSummary> {
        let (nickname, theme) = self.validate_start(learner_nickname, theme, difficulty_level)?;
        let mut state = SessionState::new(nickname, theme, difficulty_level);
        let mastered = self.previously_mastered(&state.learner_nickname).await;

        let plan = match self
            .planner
            .plan(&state.theme, difficulty_level, &mastered)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                state.transition_to(Phase::Failed)?;
                bump(&self.counters.planning_failures);
                warn!(session_id = %state.session_id, theme = %state.theme, error = %e, "Session planning failed");
                self.telemetry.send(TelemetryEvent::planning_failed(
                    meta(&state),
                    e.code(),
                    e.to_string(),
                ));
                return Err(e);
            }
        };

        state.set_plan(plan.title, plan.milestones);
        let mut state = projector::activate_next(state);
        self.commit(&mut state, None, "start").await?;

        bump(&self.counters.sessions_started);
        info!(
            session_id = %state.session_id,
            theme = %state.theme,
            milestones = state.milestones.len(),
            phase = %state.phase,
            "Session started"
        );
        self.telemetry
            .send(TelemetryEvent::SessionStarted(SessionStartedPayload {
                meta: meta(&state),
                learner_nickname: state.learner_nickname.clone(),
                difficulty_level,
                total_milestones: state.milestones.len(),
                first_milestone: state.active_milestone().map(|m| m.id.clone()),
            }));

        Ok(SessionSummary::from(&state))
    }

    fn validate_start(
        &self,
        learner_nickname: &str,
        theme: &str,
        difficulty_level: u8,
    ) -> Result<(String, String)> {
        let lesson = &self.config.lesson;

        let nickname = learner_nickname.trim();
        if nickname.is_empty() {
            return Err(TutorError::invalid_request("nickname must not be empty"));
        }
        if nickname.chars().count() > lesson.max_nickname_length {
            return Err(TutorError::invalid_request(format!(
                "nickname must be at most {} characters",
                lesson.max_nickname_length
            )));
        }

        let theme = lesson.resolve_theme(theme).ok_or_else(|| {
            TutorError::invalid_request(format!(
                "unknown theme '{}'; choose one of: {}",
                theme.trim(),
                lesson.themes.join(", ")
            ))
        })?;

        if !(lesson.min_difficulty..=lesson.max_difficulty).contains(&difficulty_level) {
            return Err(TutorError::invalid_request(format!(
                "difficulty level must be between {} and {}",
                lesson.min_difficulty, lesson.max_difficulty
            )));
        }

        Ok((nickname.to_string(), theme.to_string()))
    }

    /// Badges the learner earned in earlier sessions, oldest first.
    async fn previously_mastered(&self, learner_nickname: &str) -> Vec<String> {
        let mut earlier = match self.store.sessions_for_learner(learner_nickname).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Could not look up earlier sessions for mastered concepts");
                return Vec::new();
            }
        };
        earlier.sort_by_key(|s| s.created_at);

        let mut mastered: Vec<String> = Vec::new();
        for badge in earlier.into_iter().flat_map(|s| s.badges_earned) {
            if !mastered.contains(&badge) {
                mastered.push(badge);
            }
        }
        mastered
    }

    // ------------------------------------------------------------------------
    // submit
    // ------------------------------------------------------------------------

    /// Grades a submission for the active milestone.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::submit_for_milestone`].
    pub async fn submit(
        &self,
        session_id: &str,
        code: &str,
        test_results: serde_json::Value,
    ) -> Result<GradeOutcome> {
        self.submit_for_milestone(session_id, None, code, test_results)
            .await
    }

    /// Grades a submission, rejecting it if `milestone_id` is given and is no
    /// longer the active milestone.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound`, `SessionCompleted` or `InvalidPhase`
    /// - `StaleMilestone` when `milestone_id` is not the active milestone
    /// - `PersistenceError` if the result cannot be saved
    pub async fn submit_for_milestone(
        &self,
        session_id: &str,
        milestone_id: Option<&str>,
        code: &str,
        test_results: serde_json::Value,
    ) -> Result<GradeOutcome> {
        let _guard = self.locks.acquire(session_id).await;
        let previous = self.load_existing(session_id).await?;

        match previous.phase {
            Phase::MilestoneActive | Phase::AwaitingGrading => {}
            Phase::Completed => {
                warn!(session_id, "Submission for a completed session");
                return Err(TutorError::session_completed(session_id));
            }
            phase => return Err(TutorError::invalid_phase(session_id, phase, "submit code for")),
        }
        let milestone = active_milestone(&previous, milestone_id)?;

        let mut state = previous.clone();
        state.transition_to(Phase::AwaitingGrading)?;

        let verdict = self
            .grader
            .grade(code, &test_results, &milestone.goal)
            .await;

        state.attempt_count += 1;
        state.last_submitted_code = Some(code.to_string());
        state.last_test_results = (!test_results.is_null()).then_some(test_results);
        state.last_feedback = Some(verdict.feedback.clone());
        state.add_attempt(AttemptRecord {
            milestone_id: milestone.id.clone(),
            attempt: state.attempt_count,
            passed: verdict.passed,
            xp_awarded: verdict.xp_awarded,
            feedback: verdict.feedback.clone(),
            degraded: verdict.degraded,
            timestamp: Utc::now(),
        });

        let mut badge_earned = None;
        if verdict.passed {
            state.advance_milestone_status(&milestone.id, MilestoneStatus::Completed)?;
            badge_earned = state.award(verdict.xp_awarded, &verdict.concepts_learned);
            state.advance_cursor();
            state = projector::activate_next(state);
        } else {
            state.transition_to(Phase::MilestoneActive)?;
        }

        self.commit(&mut state, Some(&previous), "submit").await?;

        let session_completed = state.phase == Phase::Completed;
        let next_milestone = if verdict.passed && !session_completed {
            state.active_milestone().map(MilestoneView::from)
        } else {
            None
        };

        bump(&self.counters.submissions_graded);
        info!(
            session_id,
            milestone_id = %milestone.id,
            passed = verdict.passed,
            xp = verdict.xp_awarded,
            phase = %state.phase,
            "Submission graded"
        );
        self.telemetry
            .send(TelemetryEvent::SubmissionGraded(SubmissionGradedPayload {
                meta: meta(&state),
                milestone_id: milestone.id.clone(),
                attempt: state.attempt_count,
                passed: verdict.passed,
                xp_awarded: verdict.xp_awarded,
                degraded: verdict.degraded,
            }));

        if verdict.degraded {
            bump(&self.counters.degraded_gradings);
            self.telemetry.send(TelemetryEvent::grading_failed(
                meta(&state),
                &milestone.id,
                verdict.degraded_reason.clone().unwrap_or_default(),
            ));
        }

        if verdict.passed {
            bump(&self.counters.milestones_completed);
            self.telemetry
                .send(TelemetryEvent::MilestoneCompleted(MilestoneCompletedPayload {
                    meta: meta(&state),
                    milestone_id: milestone.id.clone(),
                    badge_earned: badge_earned.clone(),
                    next_milestone: next_milestone.as_ref().map(|m| m.id.clone()),
                }));
        }

        if session_completed {
            self.record_completion(&state);
        }

        Ok(GradeOutcome {
            passed: verdict.passed,
            feedback: verdict.feedback,
            xp_awarded: if verdict.passed { verdict.xp_awarded } else { 0 },
            badge_earned,
            next_milestone,
            session_completed,
            degraded: verdict.degraded,
            summary: SessionSummary::from(&state),
        })
    }

    // ------------------------------------------------------------------------
    // request_hint
    // ------------------------------------------------------------------------

    /// Serves the next hint for the active milestone.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::request_hint_for_milestone`].
    pub async fn request_hint(&self, session_id: &str, current_code: &str) -> Result<HintOutcome> {
        self.request_hint_for_milestone(session_id, None, current_code)
            .await
    }

    /// Serves the next hint, rejecting the request if `milestone_id` is given
    /// and is no longer the active milestone.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound`, `SessionCompleted` or `InvalidPhase`
    /// - `StaleMilestone` when `milestone_id` is not the active milestone
    /// - `HintBudgetExhausted` once the budget is spent; the completion
    ///   service is not called
    /// - `HintGenerationError` if the coach fails; no hint is consumed
    /// - `PersistenceError` if the hint cannot be saved
    pub async fn request_hint_for_milestone(
        &self,
        session_id: &str,
        milestone_id: Option<&str>,
        current_code: &str,
    ) -> Result<HintOutcome> {
        let _guard = self.locks.acquire(session_id).await;
        let previous = self.load_existing(session_id).await?;

        match previous.phase {
            Phase::MilestoneActive => {}
            Phase::Completed => return Err(TutorError::session_completed(session_id)),
            phase => return Err(TutorError::invalid_phase(session_id, phase, "request a hint for")),
        }
        let milestone = active_milestone(&previous, milestone_id)?;

        let max_hints = self.config.hints.max_hints_per_milestone;
        if previous.hint_count >= max_hints {
            warn!(session_id, milestone_id = %milestone.id, max_hints, "Hint budget exhausted");
            self.telemetry.send(TelemetryEvent::hint_budget_exhausted(
                meta(&previous),
                &milestone.id,
                max_hints,
            ));
            return Err(TutorError::hint_budget_exhausted(session_id, max_hints));
        }

        let tier = HintTier::for_hint_count(previous.hint_count);
        let hint = self
            .coach
            .hint(&milestone, current_code, previous.hint_count)
            .await?;

        let mut state = previous.clone();
        state.hint_count += 1;
        state.last_hint = Some(hint.clone());
        state.add_hint(HintRecord::new(&milestone.id, state.hint_count, &hint));
        self.commit(&mut state, Some(&previous), "hint").await?;

        bump(&self.counters.hints_served);
        info!(session_id, milestone_id = %milestone.id, hint_count = state.hint_count, %tier, "Hint served");
        self.telemetry.send(TelemetryEvent::hint_requested(
            meta(&state),
            &milestone.id,
            state.hint_count,
            tier,
        ));

        Ok(HintOutcome {
            hint,
            hint_count: state.hint_count,
            tier,
            hints_remaining: state.remaining_hints(max_hints),
            budget_exhausted: state.hint_count >= max_hints,
        })
    }

    // ------------------------------------------------------------------------
    // complete / progress
    // ------------------------------------------------------------------------

    /// Ends the session. Completing an already completed session returns its
    /// summary and changes nothing.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound`
    /// - `PersistenceError` if the completion cannot be saved
    pub async fn complete(&self, session_id: &str) -> Result<SessionSummary> {
        let _guard = self.locks.acquire(session_id).await;
        let previous = self.load_existing(session_id).await?;
        if previous.phase == Phase::Completed {
            return Ok(SessionSummary::from(&previous));
        }

        let mut state = previous.clone();
        state.ended_early = !state.all_milestones_passed();
        state.transition_to(Phase::Completed)?;
        state.completed_at = Some(Utc::now());
        self.commit(&mut state, Some(&previous), "complete").await?;

        info!(session_id, ended_early = state.ended_early, xp = state.xp_earned, "Session completed");
        self.record_completion(&state);
        Ok(SessionSummary::from(&state))
    }

    /// Current progress of a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown id.
    pub async fn progress(&self, session_id: &str) -> Result<SessionSummary> {
        let state = self.load_existing(session_id).await?;
        Ok(SessionSummary::from(&state))
    }

    /// Full stored state of a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown id.
    pub async fn session(&self, session_id: &str) -> Result<SessionState> {
        self.load_existing(session_id).await
    }

    // ------------------------------------------------------------------------
    // health / status
    // ------------------------------------------------------------------------

    /// Probes the completion service and the store.
    pub async fn health(&self) -> HealthReport {
        let (completion, store) = tokio::join!(self.completion.healthy(), self.store.healthy());
        HealthReport {
            status: if completion && store {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            services: ServiceHealth {
                completion: completion.into(),
                store: store.into(),
            },
        }
    }

    /// Counters since start-up.
    #[must_use]
    pub fn status(&self) -> OrchestratorStatus {
        let c = &self.counters;
        OrchestratorStatus {
            started_at: self.started_at,
            sessions_started: c.sessions_started.load(Ordering::Relaxed),
            planning_failures: c.planning_failures.load(Ordering::Relaxed),
            submissions_graded: c.submissions_graded.load(Ordering::Relaxed),
            degraded_gradings: c.degraded_gradings.load(Ordering::Relaxed),
            milestones_completed: c.milestones_completed.load(Ordering::Relaxed),
            hints_served: c.hints_served.load(Ordering::Relaxed),
            sessions_completed: c.sessions_completed.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            active_operations: self.locks.len(),
            telemetry_subscribers: self.telemetry.receiver_count(),
            completion: self.completion.metrics(),
        }
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    async fn load_existing(&self, session_id: &str) -> Result<SessionState> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| TutorError::session_not_found(session_id))
    }

    /// Validates and saves `state`. Nothing is stored if validation fails.
    async fn commit(
        &self,
        state: &mut SessionState,
        previous: Option<&SessionState>,
        operation: &'static str,
    ) -> Result<()> {
        state.touch();
        state.check_invariants(self.config.hints.max_hints_per_milestone)?;
        if let Some(previous) = previous {
            state.check_progression(previous)?;
        }

        if let Err(e) = self.store.save(state).await {
            bump(&self.counters.persistence_failures);
            error!(session_id = %state.session_id, operation, error = %e, "Failed to persist session");
            self.telemetry.send(TelemetryEvent::persistence_failed(
                meta(state),
                operation,
                e.to_string(),
            ));
            return Err(match e {
                TutorError::PersistenceError { .. } => e,
                other => TutorError::persistence(other.to_string()),
            });
        }
        Ok(())
    }

    fn record_completion(&self, state: &SessionState) {
        bump(&self.counters.sessions_completed);
        self.telemetry
            .send(TelemetryEvent::SessionCompleted(SessionCompletedPayload {
                meta: meta(state),
                xp_earned: state.xp_earned,
                badges_earned: state.badges_earned.clone(),
                milestones_completed: state.milestones_completed(),
                total_milestones: state.milestones.len(),
                ended_early: state.ended_early,
            }));
    }
}

fn meta(state: &SessionState) -> EventMeta {
    EventMeta::new(&state.session_id, &state.theme)
}

fn active_milestone(state: &SessionState, requested: Option<&str>) -> Result<Milestone> {
    let active = state.active_milestone().cloned().ok_or_else(|| {
        TutorError::invariant(format!(
            "session '{}' is {} but has no active milestone",
            state.session_id, state.phase
        ))
    })?;
    if let Some(requested) = requested {
        if requested != active.id {
            warn!(session_id = %state.session_id, requested, active = %active.id, "Stale milestone");
            return Err(TutorError::stale_milestone(requested, &active.id));
        }
    }
    Ok(active)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::completion::{
        CompletionError, CompletionErrorKind, CompletionTask, ScriptedCompletionService,
    };
    use crate::store::MemoryStore;
    use std::time::Duration;

    const PLAN: &str = r#"{"title": "Penalty Kick", "milestones": [
        {"id": "m1", "goal": "Create the ball"},
        {"id": "m2", "goal": "Move the ball"},
        {"id": "m3", "goal": "Score a goal"}
    ]}"#;

    const PASS: &str = r#"{"success": true, "feedback": "Great!", "xp_awarded": 20, "concepts_learned": ["variables"]}"#;
    const FAIL: &str = r#"{"success": false, "feedback": "Not yet", "xp_awarded": 0}"#;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        completion: Arc<ScriptedCompletionService>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(completion: ScriptedCompletionService) -> Harness {
        let completion = Arc::new(completion);
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Config::default(),
            completion.clone(),
            store.clone(),
        ));
        Harness {
            orchestrator,
            completion,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedCompletionService::new())
    }

    async fn started(h: &Harness) -> SessionSummary {
        h.completion.push(CompletionTask::Planning, PLAN);
        h.orchestrator.start("Noa", "football", 1).await.unwrap()
    }

    async fn stored(h: &Harness, id: &str) -> SessionState {
        h.store.load(id).await.unwrap().unwrap()
    }

    // ------------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_activates_first_milestone() {
        let h = harness();
        let summary = started(&h).await;

        assert_eq!(summary.current_milestone, 0);
        assert_eq!(summary.total_milestones, 3);
        assert_eq!(summary.phase, Phase::MilestoneActive);
        assert_eq!(summary.active_milestone.as_ref().unwrap().id, "m1");
        assert_eq!(summary.lesson_title.as_deref(), Some("Penalty Kick"));

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.status_of("m1"), Some(MilestoneStatus::Active));
        assert_eq!(state.status_of("m2"), Some(MilestoneStatus::Pending));
        assert_eq!(h.completion.calls(CompletionTask::Coaching), 0);
        assert_eq!(h.orchestrator.status().sessions_started, 1);
    }

    #[tokio::test]
    async fn test_start_canonicalizes_theme() {
        let h = harness();
        h.completion.push(CompletionTask::Planning, PLAN);
        let summary = h.orchestrator.start("  Noa ", "SPACE", 2).await.unwrap();
        assert_eq!(summary.theme, "space");
        assert_eq!(summary.learner_nickname, "Noa");
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_parameters() {
        let h = harness();
        for (nick, theme, level) in [
            ("", "football", 1),
            ("Noa", "cooking", 1),
            ("Noa", "football", 0),
            ("Noa", "football", 9),
        ] {
            let err = h.orchestrator.start(nick, theme, level).await.unwrap_err();
            assert!(matches!(err, TutorError::InvalidRequest { .. }), "{err:?}");
            assert!(err.is_validation());
        }
        let long = "x".repeat(51);
        assert!(h.orchestrator.start(&long, "football", 1).await.is_err());
        assert_eq!(h.completion.calls(CompletionTask::Planning), 0);
    }

    #[tokio::test]
    async fn test_planning_failure_persists_nothing() {
        let h = harness();
        let mut events = h.orchestrator.telemetry().subscribe();
        h.completion.push_error(
            CompletionTask::Planning,
            CompletionError::new(CompletionErrorKind::Server, "proxy down"),
        );

        let err = h.orchestrator.start("Noa", "football", 1).await.unwrap_err();
        assert!(matches!(err, TutorError::PlanningError { .. }));
        assert!(err.is_retryable());
        assert!(h.store.is_empty().await);
        assert_eq!(events.recv().await.unwrap().event_name(), "planning_failed");
        assert_eq!(h.orchestrator.status().planning_failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_plan_persists_nothing() {
        let h = harness();
        h.completion
            .push(CompletionTask::Planning, r#"{"milestones": [{"id": "a"}]}"#);
        let err = h.orchestrator.start("Noa", "football", 1).await.unwrap_err();
        assert!(matches!(err, TutorError::MalformedPlanError { .. }));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_passes_previously_mastered_badges() {
        let h = harness();
        let first = started(&h).await;
        h.completion.push(CompletionTask::Grading, PASS);
        h.orchestrator
            .submit(&first.session_id, "let ball = 1;", serde_json::Value::Null)
            .await
            .unwrap();

        h.completion.push(CompletionTask::Planning, PLAN);
        h.orchestrator.start("noa", "robots", 2).await.unwrap();

        let planning: Vec<_> = h
            .completion
            .requests()
            .into_iter()
            .filter(|r| r.task == CompletionTask::Planning)
            .collect();
        assert!(planning[0].messages[1].content.contains("none yet"));
        assert!(planning[1].messages[1].content.contains("variables"));
    }

    #[tokio::test]
    async fn test_start_ignores_other_learners_badges() {
        let h = harness();
        let first = started(&h).await;
        h.completion.push(CompletionTask::Grading, PASS);
        h.orchestrator
            .submit(&first.session_id, "let ball = 1;", serde_json::Value::Null)
            .await
            .unwrap();

        h.completion.push(CompletionTask::Planning, PLAN);
        h.orchestrator.start("Kai", "robots", 2).await.unwrap();

        let planning: Vec<_> = h
            .completion
            .requests()
            .into_iter()
            .filter(|r| r.task == CompletionTask::Planning)
            .collect();
        assert!(planning[1].messages[1].content.contains("none yet"));
        assert!(!planning[1].messages[1].content.contains("variables"));
    }

    // ------------------------------------------------------------------------
    // submit
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_failed_submission_keeps_cursor() {
        let h = harness();
        let summary = started(&h).await;
        h.completion.push(CompletionTask::Grading, FAIL);

        let outcome = h
            .orchestrator
            .submit(&summary.session_id, "oops", serde_json::json!({"failed": 1}))
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.xp_awarded, 0);
        assert!(outcome.next_milestone.is_none());

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.current_milestone_index, 0);
        assert_eq!(state.phase, Phase::MilestoneActive);
        assert_eq!(state.attempt_count, 1);
        assert_eq!(state.xp_earned, 0);
        assert_eq!(state.last_feedback.as_deref(), Some("Not yet"));
        assert_eq!(state.last_test_results, Some(serde_json::json!({"failed": 1})));
        assert_eq!(state.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_passing_submission_advances_and_resets_hints() {
        let h = harness();
        let summary = started(&h).await;
        h.completion.always(CompletionTask::Coaching, "Think about it");
        h.orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap();
        h.orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap();

        h.completion.push(CompletionTask::Grading, PASS);
        let outcome = h
            .orchestrator
            .submit(&summary.session_id, "let ball = 1;", serde_json::Value::Null)
            .await
            .unwrap();

        assert!(outcome.passed);
        assert_eq!(outcome.xp_awarded, 20);
        assert_eq!(outcome.badge_earned.as_deref(), Some("variables"));
        assert_eq!(outcome.next_milestone.unwrap().id, "m2");
        assert!(!outcome.session_completed);

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.current_milestone_index, 1);
        assert_eq!(state.hint_count, 0);
        assert_eq!(state.status_of("m1"), Some(MilestoneStatus::Completed));
        assert_eq!(state.status_of("m2"), Some(MilestoneStatus::Active));
        assert_eq!(state.badges_earned, vec!["variables"]);
        assert!(state.last_test_results.is_none());
    }

    #[tokio::test]
    async fn test_passing_last_milestone_completes_session() {
        let h = harness();
        let summary = started(&h).await;
        let mut events = h.orchestrator.telemetry().subscribe();
        h.completion.always(CompletionTask::Grading, PASS);

        let mut last = None;
        for _ in 0..3 {
            last = Some(
                h.orchestrator
                    .submit(&summary.session_id, "code", serde_json::Value::Null)
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last.session_completed);
        assert!(last.next_milestone.is_none());
        // Same concept again: no new badge.
        assert!(last.badge_earned.is_none());

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.current_milestone_index, 3);
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.xp_earned, 60);
        assert!(!state.ended_early);
        assert!(state.completed_at.is_some());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.event_name());
        }
        assert_eq!(names.last(), Some(&"session_completed"));
        assert_eq!(names.iter().filter(|n| **n == "milestone_completed").count(), 3);
    }

    #[tokio::test]
    async fn test_submit_on_completed_session_is_rejected() {
        let h = harness();
        let summary = started(&h).await;
        h.orchestrator.complete(&summary.session_id).await.unwrap();
        let before = stored(&h, &summary.session_id).await;

        let err = h
            .orchestrator
            .submit(&summary.session_id, "code", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::SessionCompleted { .. }));
        assert_eq!(stored(&h, &summary.session_id).await, before);
        assert_eq!(h.completion.calls(CompletionTask::Grading), 0);
    }

    #[tokio::test]
    async fn test_submit_unknown_session() {
        let h = harness();
        let err = h
            .orchestrator
            .submit("missing", "code", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stale_milestone_submission_is_rejected() {
        let h = harness();
        let summary = started(&h).await;
        h.completion.push(CompletionTask::Grading, PASS);
        h.orchestrator
            .submit_for_milestone(&summary.session_id, Some("m1"), "code", serde_json::Value::Null)
            .await
            .unwrap();

        // Redelivery of the same submission.
        let err = h
            .orchestrator
            .submit_for_milestone(&summary.session_id, Some("m1"), "code", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::StaleMilestone { .. }));
        assert_eq!(h.completion.calls(CompletionTask::Grading), 1);
        assert_eq!(stored(&h, &summary.session_id).await.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_degraded_grading_is_a_failed_attempt() {
        let h = harness();
        let summary = started(&h).await;
        let mut events = h.orchestrator.telemetry().subscribe();
        h.completion
            .push(CompletionTask::Grading, "I think it's great");

        let outcome = h
            .orchestrator
            .submit(&summary.session_id, "code", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.degraded);

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.attempt_count, 1);
        assert!(state.attempts[0].degraded);
        assert_eq!(events.recv().await.unwrap().event_name(), "submission_graded");
        assert_eq!(events.recv().await.unwrap().event_name(), "grading_failed");
        assert_eq!(h.orchestrator.status().degraded_gradings, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_commits_nothing() {
        let h = harness();
        let summary = started(&h).await;
        let before = stored(&h, &summary.session_id).await;
        let mut events = h.orchestrator.telemetry().subscribe();

        h.store.fail_saves(true);
        h.completion.push(CompletionTask::Grading, PASS);
        let err = h
            .orchestrator
            .submit(&summary.session_id, "code", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::PersistenceError { .. }));
        assert_eq!(stored(&h, &summary.session_id).await, before);
        assert_eq!(events.recv().await.unwrap().event_name(), "persistence_failed");

        // The retry succeeds once the store recovers.
        h.store.fail_saves(false);
        h.completion.push(CompletionTask::Grading, PASS);
        let outcome = h
            .orchestrator
            .submit(&summary.session_id, "code", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(stored(&h, &summary.session_id).await.xp_earned, 20);
    }

    // ------------------------------------------------------------------------
    // hints
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_hint_budget_is_enforced() {
        let h = harness();
        let summary = started(&h).await;
        h.completion.always(CompletionTask::Coaching, "Look at line 2");

        let mut counts = Vec::new();
        for _ in 0..3 {
            let outcome = h
                .orchestrator
                .request_hint(&summary.session_id, "code")
                .await
                .unwrap();
            counts.push(outcome.hint_count);
        }
        assert_eq!(counts, vec![1, 2, 3]);

        let err = h
            .orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::HintBudgetExhausted { .. }));
        assert_eq!(h.completion.calls(CompletionTask::Coaching), 3);
        assert_eq!(stored(&h, &summary.session_id).await.hint_count, 3);
    }

    #[tokio::test]
    async fn test_hint_outcome_reports_tier_and_budget() {
        let h = harness();
        let summary = started(&h).await;
        h.completion.always(CompletionTask::Coaching, "hint");

        let first = h
            .orchestrator
            .request_hint_for_milestone(&summary.session_id, Some("m1"), "code")
            .await
            .unwrap();
        assert_eq!(first.tier, HintTier::Gentle);
        assert_eq!(first.hints_remaining, 2);
        assert!(!first.budget_exhausted);

        let second = h
            .orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap();
        assert_eq!(second.tier, HintTier::Gentle);
        assert_eq!(second.hints_remaining, 1);
        let third = h
            .orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap();
        assert_eq!(third.tier, HintTier::Progressive);
        assert!(third.budget_exhausted);

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.hints.len(), 3);
        assert_eq!(state.hints[2].hint_number, 3);
        assert_eq!(state.last_hint.as_deref(), Some("hint"));
    }

    #[tokio::test]
    async fn test_failed_hint_consumes_nothing() {
        let h = harness();
        let summary = started(&h).await;
        h.completion.push_error(
            CompletionTask::Coaching,
            CompletionError::new(CompletionErrorKind::Timeout, "slow"),
        );
        let err = h
            .orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::HintGenerationError { .. }));
        assert_eq!(stored(&h, &summary.session_id).await.hint_count, 0);
    }

    #[tokio::test]
    async fn test_hint_on_completed_session() {
        let h = harness();
        let summary = started(&h).await;
        h.orchestrator.complete(&summary.session_id).await.unwrap();
        let err = h
            .orchestrator
            .request_hint(&summary.session_id, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::SessionCompleted { .. }));
    }

    // ------------------------------------------------------------------------
    // complete / progress / status
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let h = harness();
        let summary = started(&h).await;
        let mut events = h.orchestrator.telemetry().subscribe();

        let first = h.orchestrator.complete(&summary.session_id).await.unwrap();
        let stored_first = stored(&h, &summary.session_id).await;
        let second = h.orchestrator.complete(&summary.session_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.phase, Phase::Completed);
        assert!(first.ended_early);
        assert!(first.active_milestone.is_none());
        assert_eq!(stored(&h, &summary.session_id).await, stored_first);

        assert_eq!(events.recv().await.unwrap().event_name(), "session_completed");
        assert!(events.try_recv().is_err());
        assert_eq!(h.orchestrator.status().sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_progress_is_read_only() {
        let h = harness();
        let summary = started(&h).await;
        let before = stored(&h, &summary.session_id).await;
        let progress = h.orchestrator.progress(&summary.session_id).await.unwrap();
        assert_eq!(progress, summary);
        assert_eq!(stored(&h, &summary.session_id).await, before);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_serialized() {
        let h = harness_with(
            ScriptedCompletionService::new().with_delay(Duration::from_millis(20)),
        );
        let summary = started(&h).await;
        h.completion.always(CompletionTask::Grading, FAIL);

        let (a, b) = tokio::join!(
            h.orchestrator
                .submit(&summary.session_id, "a", serde_json::Value::Null),
            h.orchestrator
                .submit(&summary.session_id, "b", serde_json::Value::Null),
        );
        a.unwrap();
        b.unwrap();

        let state = stored(&h, &summary.session_id).await;
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.attempts.len(), 2);
        assert_eq!(state.attempts[1].attempt, 2);
        assert_eq!(h.orchestrator.status().active_operations, 0);
    }

    #[tokio::test]
    async fn test_health_reports_each_service() {
        let h = harness();
        assert_eq!(h.orchestrator.health().await.status, HealthStatus::Healthy);

        h.completion.set_healthy(false);
        let report = h.orchestrator.health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.services.completion, ServiceStatus::Down);
        assert_eq!(report.services.store, ServiceStatus::Up);
    }

    #[tokio::test]
    async fn test_session_locks_are_pruned() {
        let locks = SessionLocks::new();
        {
            let _a = locks.acquire("a").await;
            let _b = locks.acquire("b").await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
