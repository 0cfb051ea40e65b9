//! Status icons for CLI output

use crate::domain::operation::OperationState;
use crate::domain::plan::PhaseState;

/// Status icons for different states
pub struct StatusIcon;

impl StatusIcon {
    pub const SUCCESS: &'static str = "✓";

    pub const WARNING: &'static str = "⚠";

    pub const ERROR: &'static str = "✗";

    pub const PENDING: &'static str = "⏳";

    /// Running phase
    pub const RUNNING: &'static str = "→";

    pub fn for_phase(state: PhaseState) -> &'static str {
        match state {
            PhaseState::Completed => Self::SUCCESS,
            PhaseState::InProgress => Self::RUNNING,
            PhaseState::Failed => Self::ERROR,
            PhaseState::RolledBack => Self::WARNING,
            PhaseState::Unstarted => Self::PENDING,
        }
    }

    pub fn for_operation(state: OperationState) -> &'static str {
        match state {
            OperationState::Completed => Self::SUCCESS,
            OperationState::InProgress => Self::RUNNING,
            OperationState::Failed => Self::ERROR,
            OperationState::Pending => Self::PENDING,
        }
    }

    /// Human text for a phase state
    pub fn phase_text(state: PhaseState) -> &'static str {
        match state {
            PhaseState::Unstarted => "Unstarted",
            PhaseState::InProgress => "In Progress",
            PhaseState::Completed => "Completed",
            PhaseState::Failed => "Failed",
            PhaseState::RolledBack => "Rolled Back",
        }
    }
}
