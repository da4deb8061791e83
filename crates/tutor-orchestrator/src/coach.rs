//! Hint generation stage.
//!
//! The coach escalates from a gentle nudge to a worked example as more hints
//! are requested for the same milestone. It does not enforce the hint
//! budget; the orchestrator does that before calling it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::completion::{CompletionRequest, CompletionService, CompletionTask};
use crate::error::{Result, TutorError};
use crate::session_state::Milestone;

const COACH_SYSTEM_PROMPT: &str = "You are a patient coding coach for young learners. \
Never hand over the full solution unless asked for a worked example. \
Answer in at most five sentences.";

/// How much a hint gives away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintTier {
    /// A question or pointer toward the right idea.
    Gentle,
    /// Names the concept and the part of the code to change.
    Progressive,
    /// A short worked example of the technique.
    WorkedExample,
}

impl HintTier {
    /// Tier for the next hint given how many were already served.
    ///
    /// ```
    /// use tutor_orchestrator::HintTier;
    ///
    /// assert_eq!(HintTier::for_hint_count(0), HintTier::Gentle);
    /// assert_eq!(HintTier::for_hint_count(1), HintTier::Gentle);
    /// assert_eq!(HintTier::for_hint_count(2), HintTier::Progressive);
    /// assert_eq!(HintTier::for_hint_count(3), HintTier::WorkedExample);
    /// ```
    #[must_use]
    pub const fn for_hint_count(hints_so_far: u32) -> Self {
        match hints_so_far {
            0 | 1 => Self::Gentle,
            2 => Self::Progressive,
            _ => Self::WorkedExample,
        }
    }

    const fn instruction(self) -> &'static str {
        match self {
            Self::Gentle => {
                "Give a gentle nudge: ask a guiding question or point at where to look. Do not name the fix."
            }
            Self::Progressive => {
                "Give a more specific hint: name the concept needed and the line or block to change."
            }
            Self::WorkedExample => {
                "Give a short worked example of the technique on a different variable or value, then say how it applies here."
            }
        }
    }
}

impl std::fmt::Display for HintTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gentle => write!(f, "gentle"),
            Self::Progressive => write!(f, "progressive"),
            Self::WorkedExample => write!(f, "worked_example"),
        }
    }
}

/// Produces hints for the active milestone.
pub struct Coach {
    service: Arc<dyn CompletionService>,
}

impl std::fmt::Debug for Coach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coach").finish_non_exhaustive()
    }
}

impl Coach {
    /// Creates a coach backed by `service`.
    #[must_use]
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// Generates one hint.
    ///
    /// The planner's hint for this step, when there is one, is passed to the
    /// model as a starting point.
    ///
    /// # Errors
    ///
    /// Returns `HintGenerationError` if the completion fails or comes back empty.
    pub async fn hint(
        &self,
        milestone: &Milestone,
        student_code: &str,
        hint_count_so_far: u32,
    ) -> Result<String> {
        let tier = HintTier::for_hint_count(hint_count_so_far);
        let mut user = format!(
            "Milestone goal: {}\n\nLearner's current code:\n```\n{student_code}\n```\n\n\
             This is hint number {} for this milestone. {}",
            milestone.goal,
            hint_count_so_far + 1,
            tier.instruction()
        );
        let planned = usize::try_from(hint_count_so_far)
            .ok()
            .and_then(|i| milestone.hints.get(i));
        if let Some(planned) = planned {
            user.push_str("\nThe lesson plan suggests this hint; adapt it to the code above: ");
            user.push_str(planned);
        }
        let request = CompletionRequest::new(CompletionTask::Coaching, COACH_SYSTEM_PROMPT, user)
            .with_metadata(serde_json::json!({ "tier": tier }));
        debug!(%tier, prompt_len = request.prompt_len(), "Requesting hint");

        let response = self.service.complete(request).await.map_err(|e| {
            warn!(%tier, error = %e, "Coach completion failed");
            TutorError::hint_generation(e.to_string())
        })?;

        let hint = response.content.trim();
        if hint.is_empty() {
            return Err(TutorError::hint_generation("the model returned an empty hint"));
        }
        Ok(hint.to_string())
    }
}
