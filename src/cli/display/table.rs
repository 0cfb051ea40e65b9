//! Table rendering for CLI output

use super::{StatePalette, StatusIcon};
use crate::domain::dispatcher::ResolvedOperation;
use crate::domain::operation::Operation;
use crate::domain::plan::{OperationPlan, Phase, PhaseState};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, CellAlignment, ContentArrangement, Table};

const TIME_FORMAT: &str = "%a %b %e %H:%M UTC";

/// Table renderer for formatted output
pub struct TableRenderer {
    palette: StatePalette,
}

impl Default for TableRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten<'a>(phases: &'a [Phase], depth: usize, out: &mut Vec<(usize, &'a Phase)>) {
    for phase in phases {
        out.push((depth, phase));
        flatten(&phase.phases, depth + 1, out);
    }
}

impl TableRenderer {
    pub fn new() -> Self {
        Self {
            palette: StatePalette::default(),
        }
    }

    /// Render a plan as a tree of phases, followed by the errors of failed
    /// leaves.
    pub fn render_plan(&self, operation: Option<&Operation>, plan: &OperationPlan) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("PHASE").set_alignment(CellAlignment::Left),
                Cell::new("DESCRIPTION").set_alignment(CellAlignment::Left),
                Cell::new("STATE").set_alignment(CellAlignment::Left),
                Cell::new("NODE").set_alignment(CellAlignment::Left),
                Cell::new("REQUIRES").set_alignment(CellAlignment::Left),
                Cell::new("UPDATED").set_alignment(CellAlignment::Left),
            ]);

        let mut rows = Vec::new();
        flatten(&plan.phases, 0, &mut rows);
        for (depth, phase) in &rows {
            let marker = if phase.is_leaf() { "*" } else { "+" };
            table.add_row(vec![
                Cell::new(format!("{}{} {}", "  ".repeat(*depth), marker, phase.id)),
                Cell::new(&phase.description),
                Cell::new(format!(
                    "{} {}",
                    StatusIcon::for_phase(phase.state),
                    StatusIcon::phase_text(phase.state)
                ))
                .fg(self.palette.phase(phase.state)),
                Cell::new(phase.server.as_ref().map(|s| s.hostname.as_str()).unwrap_or("-")),
                Cell::new(if phase.requires.is_empty() {
                    "-".to_string()
                } else {
                    phase.requires.join(",")
                }),
                Cell::new(
                    phase
                        .updated
                        .map(|t| t.format(TIME_FORMAT).to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]);
        }

        let mut output = String::new();
        let header = match operation {
            Some(op) => {
                let color = self.palette.operation_term(op.state);
                format!(
                    "{} {} {}",
                    op.kind,
                    op.id,
                    format!("[{} {}]", StatusIcon::for_operation(op.state), op.state).color(color)
                )
            }
            None => format!("{} {}", plan.operation_type, plan.operation_id),
        };
        output.push_str(&format!("╭─ {} ─╮\n", header));
        output.push_str(&table.to_string());
        output.push('\n');

        let failed: Vec<&&Phase> = rows
            .iter()
            .map(|(_, p)| p)
            .filter(|p| p.is_leaf() && p.state == PhaseState::Failed)
            .collect();
        if !failed.is_empty() {
            output.push_str(&format!("{}\n", "Failed phases:".red().bold()));
            for phase in failed {
                let detail = phase
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no error recorded".to_string());
                output.push_str(&format!("  {} ({}): {}\n", phase.id, phase.description, detail));
            }
        }
        output
    }

    /// One line per phase: ID and state.
    pub fn render_plan_short(&self, plan: &OperationPlan) -> String {
        let mut rows = Vec::new();
        flatten(&plan.phases, 0, &mut rows);
        let width = rows.iter().map(|(_, p)| p.id.len()).max().unwrap_or(0);
        let mut output = String::new();
        for (_, phase) in rows {
            output.push_str(&format!("{:<width$}  {}\n", phase.id, phase.state, width = width));
        }
        output
    }

    /// Render known operations, newest first
    pub fn render_operations(&self, operations: &[&ResolvedOperation]) -> String {
        if operations.is_empty() {
            return "No operations found".to_string();
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("OPERATION"),
                Cell::new("TYPE"),
                Cell::new("STATE").set_alignment(CellAlignment::Center),
                Cell::new("SOURCE"),
                Cell::new("CREATED"),
            ]);
        for resolved in operations {
            let op = &resolved.operation;
            table.add_row(vec![
                Cell::new(&op.id),
                Cell::new(op.kind),
                Cell::new(format!("{} {}", StatusIcon::for_operation(op.state), op.state))
                    .fg(self.palette.operation(op.state)),
                Cell::new(resolved.source),
                Cell::new(op.created.format(TIME_FORMAT)),
            ]);
        }

        let mut output = String::new();
        output.push_str(&format!(
            "╭─ Operations {} ─╮\n",
            format!("[{} total]", operations.len()).bright_black()
        ));
        output.push_str(&table.to_string());
        output.push('\n');
        output
    }
}
