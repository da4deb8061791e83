//! Lesson planning stage.
//!
//! Turns a theme and difficulty into an ordered list of milestones with one
//! completion call. The model is asked for a JSON object; a fenced
//! ```` ```json ```` block or surrounding prose is tolerated.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::completion::{CompletionRequest, CompletionService, CompletionTask};
use crate::error::{Result, TutorError};
use crate::session_state::Milestone;

const PLANNER_SYSTEM_PROMPT: &str = "You are a curriculum planner for young programmers. \
Design a short, themed coding lesson as an ordered list of milestones. \
Reply with a single JSON object and nothing else, shaped as: \
{\"title\": string, \"milestones\": [{\"id\": string, \"goal\": string, \
\"starter_code\": string, \"tests\": [string], \"hints\": [string]}]}. \
Each milestone builds on the previous one. Give three hints per milestone, easiest first.";

/// A lesson produced by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonPlan {
    /// Optional lesson title.
    pub title: Option<String>,
    /// Milestones in order.
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    milestones: Vec<RawMilestone>,
}

#[derive(Debug, Deserialize)]
struct RawMilestone {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "goal_he", alias = "goal_hebrew", alias = "objective")]
    goal: String,
    #[serde(default)]
    starter_code: String,
    #[serde(default, alias = "test_spec")]
    tests: serde_json::Value,
    #[serde(default)]
    hints: Vec<String>,
}

/// Produces milestone sequences.
pub struct Planner {
    service: Arc<dyn CompletionService>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner").finish_non_exhaustive()
    }
}

impl Planner {
    /// Creates a planner backed by `service`.
    #[must_use]
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// Plans a lesson.
    ///
    /// # Errors
    ///
    /// - `PlanningError` if the completion call fails or yields no milestones
    /// - `MalformedPlanError` if the response cannot be parsed
    pub async fn plan(
        &self,
        theme: &str,
        difficulty_level: u8,
        previously_mastered: &[String],
    ) -> Result<LessonPlan> {
        let request = CompletionRequest::new(
            CompletionTask::Planning,
            PLANNER_SYSTEM_PROMPT,
            planning_prompt(theme, difficulty_level, previously_mastered),
        )
        .with_metadata(serde_json::json!({
            "theme": theme,
            "difficulty_level": difficulty_level,
        }));
        debug!(theme, difficulty_level, prompt_len = request.prompt_len(), "Requesting lesson plan");

        let response = self.service.complete(request).await.map_err(|e| {
            warn!(theme, error = %e, "Planner completion failed");
            TutorError::planning(e.to_string())
        })?;

        let plan = parse_plan(&response.content)?;
        info!(
            theme,
            difficulty_level,
            milestones = plan.milestones.len(),
            "Lesson planned"
        );
        Ok(plan)
    }
}

fn planning_prompt(theme: &str, difficulty_level: u8, previously_mastered: &[String]) -> String {
    let mastered = if previously_mastered.is_empty() {
        "none yet".to_string()
    } else {
        previously_mastered.join(", ")
    };
    format!(
        "Theme: {theme}\nDifficulty (1-5): {difficulty_level}\n\
         Concepts the learner already mastered: {mastered}\n\
         Plan 3 to 5 milestones that introduce new concepts before revisiting mastered ones."
    )
}

/// Parses a planner response into a lesson plan.
///
/// Milestones without an id get `milestone_<index>`.
pub fn parse_plan(content: &str) -> Result<LessonPlan> {
    let json = extract_json(content)
        .ok_or_else(|| TutorError::malformed_plan("response contains no JSON object"))?;

    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| TutorError::malformed_plan(e.to_string()))?;

    let raw: RawPlan = if value.is_array() {
        RawPlan {
            title: None,
            milestones: serde_json::from_value(value)
                .map_err(|e| TutorError::malformed_plan(e.to_string()))?,
        }
    } else {
        serde_json::from_value(value).map_err(|e| TutorError::malformed_plan(e.to_string()))?
    };

    if raw.milestones.is_empty() {
        return Err(TutorError::planning("the plan contained no milestones"));
    }

    let mut seen = HashSet::new();
    let mut milestones = Vec::with_capacity(raw.milestones.len());
    for (index, m) in raw.milestones.into_iter().enumerate() {
        let id = m
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("milestone_{index}"));
        if m.goal.trim().is_empty() {
            return Err(TutorError::malformed_plan(format!(
                "milestone '{id}' has an empty goal"
            )));
        }
        if !seen.insert(id.clone()) {
            return Err(TutorError::malformed_plan(format!(
                "duplicate milestone id '{id}'"
            )));
        }
        milestones.push(Milestone {
            id,
            goal: m.goal.trim().to_string(),
            starter_code: m.starter_code,
            test_spec: m.tests,
            hints: m.hints,
        });
    }

    Ok(LessonPlan {
        title: raw.title.filter(|t| !t.trim().is_empty()),
        milestones,
    })
}

fn fenced_block() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").ok())
        .as_ref()
}

/// Extracts the JSON payload from a model response.
///
/// Prefers a fenced code block. Otherwise each `{` or `[` is tried in turn,
/// spanning to the last matching closer, and the first span that parses as
/// JSON wins. Bracketed prose such as `[note]` before the payload is skipped.
pub(crate) fn extract_json(content: &str) -> Option<&str> {
    if let Some(inner) = fenced_block()
        .and_then(|re| re.captures(content))
        .and_then(|caps| caps.get(1))
    {
        let inner = inner.as_str().trim();
        if inner.starts_with('{') || inner.starts_with('[') {
            return Some(inner);
        }
    }

    content
        .match_indices(['{', '['])
        .filter_map(|(start, open)| {
            let close = if open == "{" { '}' } else { ']' };
            let end = content.rfind(close)?;
            (end > start).then(|| &content[start..=end])
        })
        .find(|span| serde_json::from_str::<serde::de::IgnoredAny>(span).is_ok())
}
