//! End-to-end tests for the session lifecycle.
//!
//! These tests drive the orchestrator through whole lessons with a scripted
//! completion service and check the persisted state after every step.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tutor_orchestrator::{
    CompletionError, CompletionErrorKind, CompletionTask, Config, JsonFileStore, MemoryStore,
    MilestoneStatus, Orchestrator, PersistenceStore, Phase, ScriptedCompletionService, TutorError,
};
use tutor_report::{MarkdownGenerator, ReportGenerator, ReportInput, ReportPhase};

const PLAN: &str = r#"{"title": "Penalty Kick", "milestones": [
    {"id": "ball", "goal": "Create the ball", "starter_code": "ball = None"},
    {"id": "kick", "goal": "Kick the ball"},
    {"id": "goal", "goal": "Score a goal"}
]}"#;

const PASS: &str = r#"{"success": true, "feedback": "Great!", "xp_awarded": 20, "concepts_learned": ["variables"]}"#;
const FAIL: &str = r#"{"success": false, "feedback": "Not yet", "xp_awarded": 15}"#;

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    completion: Arc<ScriptedCompletionService>,
    store: Arc<MemoryStore>,
}

fn fixture_with(completion: ScriptedCompletionService) -> Fixture {
    let completion = Arc::new(completion);
    completion.always(CompletionTask::Planning, PLAN);
    completion.always(CompletionTask::Coaching, "Think about what the ball needs first.");
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Config::default(),
        completion.clone(),
        store.clone(),
    ));
    Fixture {
        orchestrator,
        completion,
        store,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedCompletionService::new())
}

async fn start(fixture: &Fixture) -> String {
    fixture
        .orchestrator
        .start("Noa", "football", 1)
        .await
        .expect("start should succeed")
        .session_id
}

// ============================================================================
// Scenarios
// ============================================================================

/// A new session activates its first milestone.
#[tokio::test]
async fn test_start_activates_first_milestone() {
    let f = fixture();
    let id = start(&f).await;

    let state = f.store.load(&id).await.unwrap().expect("session persisted");
    assert_eq!(state.current_milestone_index, 0);
    assert_eq!(state.phase, Phase::MilestoneActive);
    assert_eq!(state.status_of("ball"), Some(MilestoneStatus::Active));
    assert_eq!(state.status_of("kick"), Some(MilestoneStatus::Pending));
    assert_eq!(state.lesson_title.as_deref(), Some("Penalty Kick"));
    assert_eq!(f.completion.calls(CompletionTask::Coaching), 0);
}

/// Passing the last milestone completes the session.
#[tokio::test]
async fn test_passing_last_milestone_completes_session() {
    let f = fixture();
    f.completion.always(CompletionTask::Grading, PASS);
    let id = start(&f).await;

    f.orchestrator.submit(&id, "ball = 1", json!({})).await.unwrap();
    f.orchestrator.submit(&id, "kick()", json!({})).await.unwrap();
    let before = f.store.load(&id).await.unwrap().unwrap().xp_earned;

    let outcome = f.orchestrator.submit(&id, "score()", json!({})).await.unwrap();
    assert!(outcome.passed);
    assert!(outcome.session_completed);
    assert!(outcome.next_milestone.is_none());

    let state = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.current_milestone_index, state.milestones.len());
    assert_eq!(state.phase, Phase::Completed);
    assert_eq!(state.xp_earned, before + 20);
    assert!(!state.ended_early);
    assert!(state.completed_at.is_some());
}

/// The hint budget allows three hints and refuses the fourth.
#[tokio::test]
async fn test_hint_budget_exhausted_on_fourth_request() {
    let f = fixture();
    let id = start(&f).await;

    for expected in 1..=3 {
        let outcome = f.orchestrator.request_hint(&id, "ball =").await.unwrap();
        assert_eq!(outcome.hint_count, expected);
    }

    let err = f.orchestrator.request_hint(&id, "ball =").await.unwrap_err();
    assert!(matches!(err, TutorError::HintBudgetExhausted { .. }));
    assert!(err.is_validation());
    assert_eq!(f.completion.calls(CompletionTask::Coaching), 3);

    let state = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.hint_count, 3);
    assert_eq!(state.hints.len(), 3);
}

/// Submitting to a completed session is rejected without changes.
#[tokio::test]
async fn test_submit_on_completed_session_changes_nothing() {
    let f = fixture();
    f.completion.always(CompletionTask::Grading, PASS);
    let id = start(&f).await;
    f.orchestrator.complete(&id).await.unwrap();
    let before = f.store.load(&id).await.unwrap().unwrap();

    let err = f.orchestrator.submit(&id, "late", json!({})).await.unwrap_err();
    assert!(matches!(err, TutorError::SessionCompleted { .. }));

    let after = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(f.completion.calls(CompletionTask::Grading), 0);
}

// ============================================================================
// Properties
// ============================================================================

/// Xp never decreases and the cursor only moves on a pass.
#[tokio::test]
async fn test_xp_and_cursor_are_monotonic() {
    let f = fixture();
    for verdict in [FAIL, PASS, FAIL, FAIL, PASS, "garbage", PASS] {
        f.completion.push(CompletionTask::Grading, verdict);
    }
    let id = start(&f).await;

    let mut xp = 0;
    let mut cursor = 0;
    for _ in 0..7 {
        let outcome = f.orchestrator.submit(&id, "code", json!({})).await.unwrap();
        let state = f.store.load(&id).await.unwrap().unwrap();

        assert!(state.xp_earned >= xp);
        if outcome.passed {
            assert_eq!(state.current_milestone_index, cursor + 1);
            assert_eq!(state.hint_count, 0);
        } else {
            assert_eq!(state.current_milestone_index, cursor);
            assert_eq!(outcome.xp_awarded, 0);
        }
        xp = state.xp_earned;
        cursor = state.current_milestone_index;
    }

    let state = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.phase, Phase::Completed);
    assert_eq!(state.xp_earned, 60);
    assert_eq!(state.attempt_count, 7);
    assert_eq!(state.badges_earned, vec!["variables".to_string()]);
}

/// Hint count resets when the cursor advances.
#[tokio::test]
async fn test_hint_count_resets_on_advance() {
    let f = fixture();
    f.completion.always(CompletionTask::Grading, PASS);
    let id = start(&f).await;

    f.orchestrator.request_hint(&id, "").await.unwrap();
    f.orchestrator.request_hint(&id, "").await.unwrap();
    f.orchestrator.submit(&id, "ball = 1", json!({})).await.unwrap();

    let state = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.hint_count, 0);
    assert_eq!(state.hints.len(), 2);

    let outcome = f.orchestrator.request_hint(&id, "").await.unwrap();
    assert_eq!(outcome.hint_count, 1);
}

/// Completing twice returns the same summary.
#[tokio::test]
async fn test_complete_twice_is_idempotent() {
    let f = fixture();
    let id = start(&f).await;

    let first = f.orchestrator.complete(&id).await.unwrap();
    let second = f.orchestrator.complete(&id).await.unwrap();

    assert_eq!(first, second);
    assert!(first.ended_early);
    assert_eq!(first.phase, Phase::Completed);
}

/// Degraded grading counts as a failed attempt.
#[tokio::test]
async fn test_grading_outage_is_a_failed_attempt() {
    let f = fixture();
    f.completion.push_error(
        CompletionTask::Grading,
        CompletionError::new(CompletionErrorKind::Timeout, "timed out"),
    );
    let id = start(&f).await;

    let outcome = f.orchestrator.submit(&id, "ball = 1", json!({})).await.unwrap();
    assert!(!outcome.passed);
    assert!(outcome.degraded);

    let state = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.phase, Phase::MilestoneActive);
    assert_eq!(state.attempt_count, 1);
    assert!(state.attempts[0].degraded);
}

// ============================================================================
// Concurrency and persistence
// ============================================================================

/// Concurrent submissions to one session are applied one at a time.
#[tokio::test]
async fn test_concurrent_submissions_are_serialized() {
    let f = fixture_with(ScriptedCompletionService::new().with_delay(Duration::from_millis(20)));
    f.completion.always(CompletionTask::Grading, PASS);
    let id = start(&f).await;

    let a = {
        let orchestrator = Arc::clone(&f.orchestrator);
        let id = id.clone();
        tokio::spawn(async move { orchestrator.submit(&id, "a", json!({})).await })
    };
    let b = {
        let orchestrator = Arc::clone(&f.orchestrator);
        let id = id.clone();
        tokio::spawn(async move { orchestrator.submit(&id, "b", json!({})).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let state = f.store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.attempt_count, 2);
    assert_eq!(state.current_milestone_index, 2);
    assert_eq!(state.xp_earned, 40);
}

/// Independent sessions make progress in parallel.
#[tokio::test]
async fn test_independent_sessions_run_in_parallel() {
    let f = fixture_with(ScriptedCompletionService::new().with_delay(Duration::from_millis(10)));
    f.completion.always(CompletionTask::Grading, PASS);

    let mut handles = Vec::new();
    for nickname in ["Noa", "Sam", "Ari", "Kai"] {
        let orchestrator = Arc::clone(&f.orchestrator);
        handles.push(tokio::spawn(async move {
            let summary = orchestrator.start(nickname, "space", 2).await?;
            orchestrator
                .submit(&summary.session_id, "code", json!({}))
                .await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.passed);
    }

    assert_eq!(f.store.len().await, 4);
    assert_eq!(f.orchestrator.status().sessions_started, 4);
}

/// A failed save leaves the stored session untouched and can be retried.
#[tokio::test]
async fn test_persistence_failure_is_retryable() {
    let f = fixture();
    f.completion.always(CompletionTask::Grading, PASS);
    let id = start(&f).await;
    let before = f.store.load(&id).await.unwrap().unwrap();

    f.store.fail_saves(true);
    let err = f.orchestrator.submit(&id, "ball = 1", json!({})).await.unwrap_err();
    assert!(matches!(err, TutorError::PersistenceError { .. }));
    assert!(err.is_retryable());
    assert_eq!(f.store.load(&id).await.unwrap().unwrap(), before);

    f.store.fail_saves(false);
    let outcome = f.orchestrator.submit(&id, "ball = 1", json!({})).await.unwrap();
    assert!(outcome.passed);
}

/// Sessions survive a restart when stored on disk.
#[tokio::test]
async fn test_sessions_survive_restart_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let completion = Arc::new(ScriptedCompletionService::new());
    completion.always(CompletionTask::Planning, PLAN);
    completion.always(CompletionTask::Grading, PASS);

    let id = {
        let orchestrator = Orchestrator::new(
            Config::default(),
            completion.clone(),
            Arc::new(JsonFileStore::new(dir.path())),
        );
        let summary = orchestrator.start("Noa", "robots", 3).await.unwrap();
        orchestrator
            .submit(&summary.session_id, "ball = 1", json!({"passed": 3}))
            .await
            .unwrap();
        summary.session_id
    };

    let restarted = Orchestrator::new(
        Config::default(),
        completion,
        Arc::new(JsonFileStore::new(dir.path())),
    );
    let summary = restarted.progress(&id).await.unwrap();
    assert_eq!(summary.current_milestone, 1);
    assert_eq!(summary.xp_earned, 20);
    assert_eq!(summary.phase, Phase::MilestoneActive);

    let state = restarted.session(&id).await.unwrap();
    assert_eq!(state.last_test_results, Some(json!({"passed": 3})));
}

/// A second session for the same learner sees earlier badges.
#[tokio::test]
async fn test_second_session_sends_mastered_concepts_to_planner() {
    let f = fixture();
    f.completion.always(CompletionTask::Grading, PASS);
    let first = start(&f).await;
    f.orchestrator.submit(&first, "ball = 1", json!({})).await.unwrap();

    f.orchestrator.start("noa", "space", 1).await.unwrap();

    let planning: Vec<_> = f
        .completion
        .requests()
        .into_iter()
        .filter(|r| r.task == CompletionTask::Planning)
        .collect();
    assert_eq!(planning.len(), 2);
    let prompt = &planning[1].messages[1].content;
    assert!(prompt.contains("variables"));
}

// ============================================================================
// Reports
// ============================================================================

/// A finished session renders into a report.
#[tokio::test]
async fn test_finished_session_renders_report() {
    let f = fixture();
    f.completion.always(CompletionTask::Grading, PASS);
    f.completion.push(CompletionTask::Grading, FAIL);
    let id = start(&f).await;

    f.orchestrator.request_hint(&id, "").await.unwrap();
    for _ in 0..4 {
        f.orchestrator.submit(&id, "code", json!({})).await.unwrap();
    }
    let state = f.orchestrator.session(&id).await.unwrap();

    let input = ReportInput {
        session_id: state.session_id.clone(),
        learner_nickname: state.learner_nickname.clone(),
        theme: state.theme.clone(),
        lesson_title: state.lesson_title.clone(),
        difficulty_level: state.difficulty_level,
        phase: ReportPhase::Completed,
        ended_early: state.ended_early,
        xp_earned: state.xp_earned,
        badges_earned: state.badges_earned.clone(),
        created_at: state.created_at,
        updated_at: state.updated_at,
        completed_at: state.completed_at,
        milestones: state
            .milestones
            .iter()
            .map(|m| tutor_report::MilestoneInput {
                id: m.id.clone(),
                goal: m.goal.clone(),
                status: tutor_report::MilestoneState::Completed,
            })
            .collect(),
        attempts: state
            .attempts
            .iter()
            .map(|a| tutor_report::AttemptInput {
                milestone_id: a.milestone_id.clone(),
                attempt: a.attempt,
                passed: a.passed,
                xp_awarded: a.xp_awarded,
                feedback: a.feedback.clone(),
                degraded: a.degraded,
                timestamp: a.timestamp,
            })
            .collect(),
        hints: state
            .hints
            .iter()
            .map(|h| tutor_report::HintInput {
                milestone_id: h.milestone_id.clone(),
                hint_number: h.hint_number,
                hint: h.hint.clone(),
                timestamp: h.timestamp,
            })
            .collect(),
    };

    let report = ReportGenerator::new(&input).generate().unwrap();
    assert_eq!(report.summary.attempts, 4);
    assert_eq!(report.summary.passed_attempts, 3);
    assert_eq!(report.milestones[0].attempts, 2);
    assert_eq!(report.milestones[0].hints_used, 1);

    let markdown = MarkdownGenerator::new(&report).generate();
    assert!(markdown.contains("| Milestones | 3 of 3 (100%) |"));
    assert!(markdown.contains("Lesson completed"));
}

// ============================================================================
// Configuration
// ============================================================================

fn fixture_config() -> Config {
    let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/tutor.json");
    Config::load_from_file(&path).expect("Failed to load config fixture")
}

/// The fixture config overrides budgets and themes.
#[test]
fn test_fixture_config_loads() {
    let config = fixture_config();
    assert_eq!(config.hints.max_hints_per_milestone, 2);
    assert_eq!(config.grading.max_xp_per_milestone, 10);
    assert_eq!(config.lesson.themes, vec!["dinosaurs", "space"]);
    assert_eq!(config.lesson.max_difficulty, 3);
    assert_eq!(config.completion.model_for(CompletionTask::Grading), "gpt-4o");
    assert_eq!(config.completion.model_for(CompletionTask::Planning), "gpt-4o-mini");
    assert_eq!(config.server.port, 8000);
}

/// Configured budgets bind the orchestrator.
#[tokio::test]
async fn test_configured_budgets_apply() {
    let completion = Arc::new(ScriptedCompletionService::new());
    completion.always(CompletionTask::Planning, PLAN);
    completion.always(CompletionTask::Coaching, "Roar!");
    completion.always(CompletionTask::Grading, PASS);
    let orchestrator = Orchestrator::new(fixture_config(), completion, Arc::new(MemoryStore::new()));

    let err = orchestrator.start("Noa", "football", 1).await.unwrap_err();
    assert!(matches!(err, TutorError::InvalidRequest { .. }));

    let summary = orchestrator.start("Noa", "Dinosaurs", 3).await.unwrap();
    assert_eq!(summary.theme, "dinosaurs");

    let outcome = orchestrator
        .submit(&summary.session_id, "roar()", json!({}))
        .await
        .unwrap();
    assert_eq!(outcome.xp_awarded, 10);

    orchestrator.request_hint(&summary.session_id, "").await.unwrap();
    orchestrator.request_hint(&summary.session_id, "").await.unwrap();
    let err = orchestrator
        .request_hint(&summary.session_id, "")
        .await
        .unwrap_err();
    assert!(matches!(err, TutorError::HintBudgetExhausted { .. }));
}
