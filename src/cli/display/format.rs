//! Plan output formats

use super::TableRenderer;
use crate::domain::operation::Operation;
use crate::domain::plan::OperationPlan;
use crate::shared::error::Result;
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human readable phase tree
    #[default]
    Text,
    /// Phase IDs and states only
    Short,
    Json,
    Yaml,
}

/// JSON and YAML carry the same document; text forms are for people.
pub fn render_plan(format: OutputFormat, operation: Option<&Operation>, plan: &OperationPlan) -> Result<String> {
    let renderer = TableRenderer::new();
    Ok(match format {
        OutputFormat::Text => renderer.render_plan(operation, plan),
        OutputFormat::Short => renderer.render_plan_short(plan),
        OutputFormat::Json => serde_json::to_string_pretty(plan)?,
        OutputFormat::Yaml => serde_yaml::to_string(plan)?,
    })
}
