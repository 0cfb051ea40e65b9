//! State colors shared by tables and plain terminal output

use crate::domain::operation::OperationState;
use crate::domain::plan::PhaseState;
use colored::Color as TermColor;
use comfy_table::Color as TableColor;

/// One color per lifecycle outcome. Phase and operation states map onto it.
#[derive(Debug, Clone)]
pub struct StatePalette {
    pub done: TableColor,
    pub running: TableColor,
    pub failed: TableColor,
    pub rolled_back: TableColor,
    pub idle: TableColor,
}

impl Default for StatePalette {
    fn default() -> Self {
        Self {
            done: TableColor::Green,
            running: TableColor::Cyan,
            failed: TableColor::Red,
            rolled_back: TableColor::Yellow,
            idle: TableColor::DarkGrey,
        }
    }
}

impl StatePalette {
    pub fn phase(&self, state: PhaseState) -> TableColor {
        match state {
            PhaseState::Completed => self.done,
            PhaseState::InProgress => self.running,
            PhaseState::Failed => self.failed,
            PhaseState::RolledBack => self.rolled_back,
            PhaseState::Unstarted => self.idle,
        }
    }

    pub fn operation(&self, state: OperationState) -> TableColor {
        match state {
            OperationState::Completed => self.done,
            OperationState::InProgress => self.running,
            OperationState::Failed => self.failed,
            OperationState::Pending => self.idle,
        }
    }

    /// Same color for text printed outside a table.
    pub fn operation_term(&self, state: OperationState) -> TermColor {
        to_term(self.operation(state))
    }
}

fn to_term(color: TableColor) -> TermColor {
    match color {
        TableColor::Green => TermColor::Green,
        TableColor::Cyan => TermColor::Cyan,
        TableColor::Red => TermColor::Red,
        TableColor::Yellow => TermColor::Yellow,
        TableColor::DarkGrey => TermColor::BrightBlack,
        _ => TermColor::White,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_colors() {
        let palette = StatePalette::default();
        assert_eq!(palette.phase(PhaseState::Completed), TableColor::Green);
        assert_eq!(palette.phase(PhaseState::RolledBack), TableColor::Yellow);
        assert_eq!(palette.phase(PhaseState::Failed), TableColor::Red);
        assert_eq!(palette.phase(PhaseState::Unstarted), TableColor::DarkGrey);
    }

    #[test]
    fn test_terminal_colors_follow_table_colors() {
        let palette = StatePalette::default();
        assert_eq!(palette.operation_term(OperationState::Pending), TermColor::BrightBlack);
        assert_eq!(palette.operation_term(OperationState::Failed), TermColor::Red);
        assert_eq!(to_term(TableColor::Blue), TermColor::White);
    }
}
