//! Output formatters for plans, events and status.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use ferry_core::{MigrationPlan, Platform, ProgressEvent, StatusSnapshot};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII tables and one line per event
    Table,
    /// One JSON document per output
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Renders CLI output.
pub trait Formatter: Send + Sync {
    /// Format the supported platforms.
    fn format_platforms(&self, platforms: &[Platform]) -> String;

    /// Format a plan and its steps.
    fn format_plan(&self, plan: &MigrationPlan) -> String;

    /// Format a progress event.
    fn format_event(&self, event: &ProgressEvent) -> String;

    /// Format a status snapshot.
    fn format_status(&self, status: &StatusSnapshot) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Human readable formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_platforms(&self, platforms: &[Platform]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Identifier", "Name", "Static"]);
        for platform in platforms {
            table.add_row(vec![
                Cell::new(platform.as_str()),
                Cell::new(platform.display_name()),
                Cell::new(if platform.is_static_site() { "yes" } else { "no" }),
            ]);
        }
        table.to_string()
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Step", "Stage", "Depends on", "Estimate"]);
        for step in &plan.steps {
            let deps: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
            table.add_row(vec![
                Cell::new(&step.id),
                Cell::new(step.stage),
                Cell::new(if deps.is_empty() {
                    "-".to_string()
                } else {
                    deps.join(", ")
                }),
                Cell::new(format!("{}s", step.estimated_duration.as_secs())),
            ]);
        }

        format!(
            "Plan {} ({} -> {}), {} steps, estimated {}s\n{}",
            plan.id,
            plan.source.display_name(),
            plan.destination.display_name(),
            plan.steps.len(),
            plan.estimated_duration.as_secs(),
            table
        )
    }

    fn format_event(&self, event: &ProgressEvent) -> String {
        let time = event.timestamp.format("%H:%M:%S%.3f");
        let subject = event.step_id.as_deref().unwrap_or("plan");
        let mut line = format!("{} {:<32} {}", time, subject, event.message);
        if let Some(progress) = event.progress {
            line.push_str(&format!(" [{:.0}%]", progress));
        }
        if let Some(error) = &event.error {
            line.push_str(&format!(" error: {}", error));
        }
        line
    }

    fn format_status(&self, status: &StatusSnapshot) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Step", "Status", "Attempts", "Error"]);
        for step in &status.steps {
            table.add_row(vec![
                Cell::new(&step.id),
                Cell::new(step.status),
                Cell::new(step.attempts),
                Cell::new(step.error.as_deref().unwrap_or("")),
            ]);
        }

        let stage = status
            .current_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut summary = format!(
            "Plan {}: {} ({:.0}%), {}/{} completed, {} failed, {} cancelled, stage {}, elapsed {:.1}s",
            status.plan_id,
            status.status,
            status.progress,
            status.completed_steps,
            status.total_steps,
            status.failed_steps,
            status.cancelled_steps,
            stage,
            status.elapsed.as_secs_f64()
        );
        if let Some(error) = &status.error {
            summary.push_str(&format!("\nerror: {}", error));
        }
        format!("{}\n{}", summary, table)
    }
}

/// JSON formatter, one document per call.
pub struct JsonFormatter;

impl JsonFormatter {
    fn encode<T: serde::Serialize>(value: &T) -> String {
        serde_json::to_string(value)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
    }
}

impl Formatter for JsonFormatter {
    fn format_platforms(&self, platforms: &[Platform]) -> String {
        Self::encode(&platforms)
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        Self::encode(plan)
    }

    fn format_event(&self, event: &ProgressEvent) -> String {
        Self::encode(event)
    }

    fn format_status(&self, status: &StatusSnapshot) -> String {
        Self::encode(status)
    }
}
