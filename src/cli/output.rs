//! Output formatting for CLI commands.
//!
//! This module renders plans, apply reports, graphs and recorded state
//! either as colored tables or as JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ResourceKind, ValidationResult};
use crate::graph::ResourceGraph;
use crate::planner::{Action, ApplyReport, Change, Plan, StepStatus};
use crate::state::{LockInfo, StateEntry, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step row for table display.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// State entry row for table display.
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Flags")]
    flags: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Graph instance row for table display.
#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the configured format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - state matches the document.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = if plan.destroy { "Destroy Plan" } else { "Plan" };
        let _ = writeln!(output, "\n{title} {}", short(&plan.id).dimmed());
        let _ = writeln!(output, "   State serial: {}\n", plan.state.serial);

        let rows: Vec<ChangeRow> = plan
            .changes
            .iter()
            .filter(|c| c.action != Action::NoOp)
            .enumerate()
            .map(|(i, c)| ChangeRow {
                index: i + 1,
                action: Self::format_action(c),
                address: c.address.to_string(),
                reason: Self::describe_change(c),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy ({} steps)\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.destroy.to_string().red(),
            plan.steps.len()
        );

        output
    }

    /// Formats the outcome of an apply.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let status = if report.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply finished with errors", "✗".red())
        };

        let mut output = format!("{status}\n\n");

        let rows: Vec<StepRow> = report
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Succeeded)
            .map(|s| StepRow {
                step: s.id.to_string(),
                status: Self::format_status(s.status, s.tainted),
                error: s.error.as_deref().map(|e| truncate(e, 60)).unwrap_or_default(),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push_str("\n\n");
        }

        let _ = writeln!(output, "   Succeeded: {}", report.succeeded().count());
        let _ = writeln!(output, "   Failed: {}", report.failed().count());
        let _ = writeln!(output, "   Blocked: {}", report.blocked().count());
        let _ = writeln!(output, "   Not started: {}", report.pending().count());

        let tainted: Vec<String> = report.tainted().map(|s| s.address.to_string()).collect();
        if !tainted.is_empty() {
            let _ = write!(
                output,
                "\n{} Tainted, will be replaced on the next apply:\n",
                "⚠".yellow()
            );
            for address in tainted {
                let _ = writeln!(output, "   - {address}");
            }
        }

        output
    }

    /// Formats the expanded graph in dependency order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        match self.format {
            OutputFormat::Json => {
                let instances: Vec<InstanceJson> = graph
                    .order()
                    .iter()
                    .filter_map(|a| graph.get(a))
                    .map(|i| InstanceJson {
                        address: i.address.to_string(),
                        kind: kind_name(i.kind),
                        dependencies: i.dependencies.iter().map(ToString::to_string).collect(),
                    })
                    .collect();
                serde_json::to_string_pretty(&instances).unwrap_or_default()
            }
            OutputFormat::Text => {
                if graph.is_empty() {
                    return String::from("   No resources declared.\n");
                }

                let rows: Vec<InstanceRow> = graph
                    .order()
                    .iter()
                    .filter_map(|a| graph.get(a))
                    .enumerate()
                    .map(|(i, instance)| InstanceRow {
                        index: i + 1,
                        address: instance.address.to_string(),
                        kind: kind_name(instance.kind).to_string(),
                        dependencies: instance
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                    .collect();

                let mut output = format!("\nGraph: {} instances\n\n", graph.len());
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats the list of recorded entries.
    #[must_use]
    pub fn format_state_list(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&StateListJson::from(state))
                .unwrap_or_default(),
            OutputFormat::Text => Self::format_state_text(state),
        }
    }

    fn format_state_text(state: &StateSnapshot) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "\nState {} (serial {})\n", short(&state.lineage), state.serial);

        if state.entries.is_empty() {
            output.push_str("   No instances recorded.\n");
        } else {
            let rows: Vec<EntryRow> = state
                .entries
                .values()
                .map(|e| EntryRow {
                    address: e.address.to_string(),
                    kind: kind_name(e.kind).to_string(),
                    id: e
                        .attributes
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|id| truncate(id, 12))
                        .unwrap_or_default(),
                    flags: Self::entry_flags(e),
                    updated: e.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let deposed: usize = state.deposed.values().map(Vec::len).sum();
        if deposed > 0 {
            let _ = write!(
                output,
                "\n{} {deposed} deposed objects awaiting destroy\n",
                "⚠".yellow()
            );
        }

        if !state.history.is_empty() {
            let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
            for entry in state.history.iter().rev().take(5) {
                let status = if entry.success { "✓".green() } else { "✗".red() };
                let _ = writeln!(
                    output,
                    "     {status} {} - {:?} ({})",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.operation,
                    entry.addresses.join(", ")
                );
            }
        }

        output
    }

    /// Formats one recorded entry with its attributes.
    #[must_use]
    pub fn format_entry(&self, entry: &StateEntry) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(entry).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\n{}\n", entry.address.to_string().bold());
                let _ = writeln!(output, "   Kind: {}", kind_name(entry.kind));
                let _ = writeln!(output, "   Created: {}", entry.created_at);
                let _ = writeln!(output, "   Updated: {}", entry.updated_at);
                let flags = Self::entry_flags(entry);
                if !flags.is_empty() {
                    let _ = writeln!(output, "   Flags: {flags}");
                }
                if !entry.dependencies.is_empty() {
                    let deps: Vec<String> =
                        entry.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }
                output.push_str("\n   Attributes:\n");
                for (name, value) in &entry.attributes {
                    let _ = writeln!(output, "     {name} = {value}");
                }
                output
            }
        }
    }

    /// Formats validation findings.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result
                        .errors
                        .iter()
                        .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                        .collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Document is valid\n", "✓".green())
                } else {
                    let mut text = format!("{} Document is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(text, "   - {}: {}", error.field, error.message);
                    }
                    text
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "{} State locked by {} (id {}, expires {})\n",
                "✓".green(),
                lock.holder,
                lock.lock_id,
                lock.expires_at.format("%H:%M:%S")
            ),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, symbol: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{symbol} {message}"),
        }
    }

    /// Formats a change action with color.
    fn format_action(change: &Change) -> String {
        let label = format!("{}{}", change.symbol(), change.action);
        match change.action {
            Action::Create => label.green().to_string(),
            Action::Update => label.yellow().to_string(),
            Action::Replace => label.magenta().to_string(),
            Action::Destroy => label.red().to_string(),
            Action::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_status(status: StepStatus, tainted: bool) -> String {
        let text = match status {
            StepStatus::Succeeded => "succeeded".green().to_string(),
            StepStatus::Failed => "failed".red().to_string(),
            StepStatus::Blocked => "blocked".yellow().to_string(),
            StepStatus::Pending => "not started".dimmed().to_string(),
            StepStatus::Running => "running".yellow().to_string(),
        };
        if tainted {
            format!("{text} (tainted)")
        } else {
            text
        }
    }

    fn describe_change(change: &Change) -> String {
        let mut parts = Vec::new();
        if !change.reason.is_empty() {
            parts.push(change.reason.clone());
        }
        if !change.changed.is_empty() {
            parts.push(format!("changed: {}", change.changed.join(", ")));
        }
        if !change.unresolved.is_empty() {
            parts.push(format!("known after apply: {}", change.unresolved.join(", ")));
        }
        truncate(&parts.join("; "), 60)
    }

    fn entry_flags(entry: &StateEntry) -> String {
        let mut flags = Vec::new();
        if entry.tainted {
            flags.push("tainted".red().to_string());
        }
        if entry.prevent_destroy {
            flags.push(String::from("protected"));
        }
        if entry.create_before_destroy {
            flags.push(String::from("cbd"));
        }
        flags.join(" ")
    }
}

const fn kind_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Managed => "managed",
        ResourceKind::Trigger => "trigger",
    }
}

/// First eight characters of an identifier.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct InstanceJson {
    address: String,
    kind: &'static str,
    dependencies: Vec<String>,
}

#[derive(Serialize)]
struct StateListJson {
    lineage: String,
    serial: u64,
    addresses: Vec<String>,
    tainted: Vec<String>,
    deposed: usize,
}

impl From<&StateSnapshot> for StateListJson {
    fn from(state: &StateSnapshot) -> Self {
        Self {
            lineage: state.lineage.clone(),
            serial: state.serial,
            addresses: state.entries.keys().map(ToString::to_string).collect(),
            tainted: state
                .entries
                .values()
                .filter(|e| e.tainted)
                .map(|e| e.address.to_string())
                .collect(),
            deposed: state.deposed.values().map(Vec::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Address;
    use crate::planner::{Operation, PlanStep};
    use crate::state::StateVersion;

    fn plan() -> Plan {
        let address = Address::new("null_vm", "web");
        let change = Change {
            address: address.clone(),
            action: Action::Create,
            before: None,
            after: None,
            unresolved: vec![String::from("id")],
            changed: Vec::new(),
            reason: String::from("not in state"),
            create_before_destroy: false,
        };
        Plan::assemble(
            StateVersion {
                lineage: String::new(),
                serial: 3,
                fingerprint: String::new(),
            },
            false,
            vec![change],
            vec![PlanStep::new(address, Operation::Create)],
        )
        .unwrap()
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-identifier", 10), "a-very-...");
    }

    #[test]
    fn test_plan_text_lists_changes() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan());
        assert!(text.contains("null_vm.web"));
        assert!(text.contains("+create"));
        assert!(text.contains("known after apply: id"));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["changes"][0]["action"], "create");
    }

    #[test]
    fn test_empty_state_list() {
        colored::control::set_override(false);
        let text =
            OutputFormatter::new(OutputFormat::Text).format_state_list(&StateSnapshot::new());
        assert!(text.contains("No instances recorded"));
    }

    #[test]
    fn test_json_message() {
        let json = OutputFormatter::new(OutputFormat::Json).success("done");
        assert!(json.contains("\"status\": \"success\""));
    }
}
