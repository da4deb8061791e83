//! Milestone projection.
//!
//! Activates the milestone under the cursor or declares the session
//! complete. Pure: no I/O and no completion calls.

use chrono::Utc;

use crate::session_state::{MilestoneStatus, Phase, SessionState};

/// Activates the next milestone, or completes the session when the cursor
/// has passed the last one.
///
/// Activating an already active milestone is a no-op on its status.
///
/// # Panics
///
/// Panics if the cursor is past the end of the milestone list; that state
/// can only come from a programming error.
#[must_use]
pub fn activate_next(mut state: SessionState) -> SessionState {
    let len = state.milestones.len();
    assert!(
        state.current_milestone_index <= len,
        "milestone cursor {} out of range for {len} milestones",
        state.current_milestone_index
    );

    if state.current_milestone_index == len {
        state.phase = Phase::Completed;
        state.completed_at.get_or_insert_with(Utc::now);
    } else {
        let id = state.milestones[state.current_milestone_index].id.clone();
        let status = state.milestone_status.entry(id).or_default();
        if *status == MilestoneStatus::Pending {
            *status = MilestoneStatus::Active;
        }
        state.phase = Phase::MilestoneActive;
    }

    state.touch();
    state
}
