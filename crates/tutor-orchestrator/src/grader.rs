//! Submission grading stage.
//!
//! The grader never fails: a completion error or an unreadable response
//! becomes a conservative failing verdict marked `degraded`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::completion::{CompletionRequest, CompletionService, CompletionTask};
use crate::planner::extract_json;

const GRADER_SYSTEM_PROMPT: &str = "You grade code written by young learners. \
Use the external test results as the main evidence. \
Reply with a single JSON object and nothing else: \
{\"success\": bool, \"feedback\": string, \"xp_awarded\": integer, \"concepts_learned\": [string]}. \
Award xp only for a passing submission. Feedback is encouraging and at most three sentences.";

/// Feedback shown when grading could not be completed.
const FALLBACK_FEEDBACK: &str =
    "We couldn't check your work automatically this time. Take another look and submit again.";

/// Outcome of grading one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeVerdict {
    /// Whether the milestone goal is met.
    pub passed: bool,
    /// Feedback for the learner.
    pub feedback: String,
    /// Xp to credit; always 0 for a failing verdict.
    pub xp_awarded: u32,
    /// Concepts demonstrated, used as badge ids.
    pub concepts_learned: Vec<String>,
    /// `true` when this is the conservative fallback.
    #[serde(default)]
    pub degraded: bool,
    /// Why the fallback was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl GradeVerdict {
    /// The conservative failing verdict.
    #[must_use]
    pub fn conservative(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: FALLBACK_FEEDBACK.to_string(),
            xp_awarded: 0,
            concepts_learned: Vec::new(),
            degraded: true,
            degraded_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(alias = "passed")]
    success: bool,
    #[serde(default)]
    feedback: String,
    #[serde(default, alias = "xp")]
    xp_awarded: Option<serde_json::Value>,
    #[serde(default, alias = "concepts")]
    concepts_learned: Vec<String>,
}

/// Evaluates submissions.
pub struct Grader {
    service: Arc<dyn CompletionService>,
    max_xp: u32,
}

impl std::fmt::Debug for Grader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grader")
            .field("max_xp", &self.max_xp)
            .finish_non_exhaustive()
    }
}

impl Grader {
    /// Creates a grader that caps xp at `max_xp`.
    #[must_use]
    pub fn new(service: Arc<dyn CompletionService>, max_xp: u32) -> Self {
        Self { service, max_xp }
    }

    /// Grades a submission.
    pub async fn grade(
        &self,
        student_code: &str,
        test_results: &serde_json::Value,
        milestone_goal: &str,
    ) -> GradeVerdict {
        let results = if test_results.is_null() {
            "not provided".to_string()
        } else {
            test_results.to_string()
        };
        let user = format!(
            "Milestone goal: {milestone_goal}\n\nSubmitted code:\n```\n{student_code}\n```\n\n\
             External test results: {results}\n\nMaximum xp for this milestone: {}",
            self.max_xp
        );
        let request = CompletionRequest::new(CompletionTask::Grading, GRADER_SYSTEM_PROMPT, user);
        debug!(prompt_len = request.prompt_len(), "Requesting grade");

        match self.service.complete(request).await {
            Ok(response) => self.parse_verdict(&response.content),
            Err(e) => {
                warn!(error = %e, "Grader completion failed, using conservative verdict");
                GradeVerdict::conservative(e.to_string())
            }
        }
    }

    /// Parses a grader response, clamping xp into `0..=max_xp`.
    #[must_use]
    pub fn parse_verdict(&self, content: &str) -> GradeVerdict {
        let Some(json) = extract_json(content) else {
            warn!("Grader response contained no JSON, using conservative verdict");
            return GradeVerdict::conservative("response contained no JSON object");
        };
        let raw: RawVerdict = match serde_json::from_str(json) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Grader response did not match the verdict shape");
                return GradeVerdict::conservative(format!("unreadable verdict: {e}"));
            }
        };

        let xp_awarded = if raw.success {
            clamp_xp(raw.xp_awarded.as_ref(), self.max_xp)
        } else {
            0
        };

        let concepts_learned = if raw.success {
            raw.concepts_learned
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        } else {
            Vec::new()
        };

        let feedback = if raw.feedback.trim().is_empty() {
            if raw.success {
                "Nice work, that milestone is done!".to_string()
            } else {
                "Not quite yet. Check the failing tests and try again.".to_string()
            }
        } else {
            raw.feedback.trim().to_string()
        };

        GradeVerdict {
            passed: raw.success,
            feedback,
            xp_awarded,
            concepts_learned,
            degraded: false,
            degraded_reason: None,
        }
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn clamp_xp(value: Option<&serde_json::Value>, max_xp: u32) -> u32 {
    let xp = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if !xp.is_finite() || xp <= 0.0 {
        0
    } else {
        xp.round().min(f64::from(max_xp)) as u32
    }
}
