//! Report rendering.

use anyhow::{Context, Result};
use icelink_core::provision::{Action, ResourceOutcome};
use icelink_core::workflow::{Check, TableSummary};
use icelink_core::{Outcome, ResourceState, WorkflowReport};
use serde_json::Value;

use crate::OutputFormat;

/// Print a report on stdout.
pub fn print(report: &WorkflowReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let text =
                serde_json::to_string_pretty(report).context("Failed to serialize report")?;
            println!("{}", text);
        }
        OutputFormat::Text => {
            for line in render(report) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

/// Text lines: one per resource and check, then the overall outcome.
pub fn render(report: &WorkflowReport) -> Vec<String> {
    let mut lines = Vec::new();

    lines.push("Resources:".to_string());
    for outcome in &report.resources {
        lines.push(format!("  {}", resource_line(outcome)));
    }

    if let Some(table) = &report.table {
        lines.push(String::new());
        lines.extend(table_lines(table));
    }

    if !report.objects.is_empty() {
        lines.push(String::new());
        lines.push(format!("Objects ({}):", report.objects.len()));
        for object in &report.objects {
            lines.push(format!("  - {}", object));
        }
    }

    if !report.checks.is_empty() {
        lines.push(String::new());
        lines.push("Checks:".to_string());
        for check in &report.checks {
            lines.push(format!("  {}", check_line(check)));
        }
    }

    if !report.preview.is_empty() {
        lines.push(String::new());
        lines.push(format!("Preview ({} rows):", report.preview.len()));
        for row in &report.preview {
            lines.push(format!("  {}", Value::Object(row.clone())));
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "{} {}: {}",
        marker(report.outcome == Outcome::Success),
        report.command,
        report.outcome
    ));
    lines
}

fn resource_line(outcome: &ResourceOutcome) -> String {
    let ok = match outcome.action {
        Action::Failed | Action::Skipped => false,
        // Status reports a failed probe, not a failed run
        Action::Probed => outcome.state != ResourceState::Failed,
        _ => true,
    };
    let mut line = format!(
        "{} {}: {} ({})",
        marker(ok),
        outcome.resource,
        outcome.state,
        action_label(outcome.action)
    );
    if let Some(blocker) = outcome.blocked_by {
        line.push_str(&format!(", blocked by {}", blocker));
    }
    if let Some(detail) = &outcome.detail {
        line.push_str(&format!(" - {}", detail));
    }
    if let Some(error) = &outcome.error {
        line.push_str(&format!(" - {}", error));
    }
    line
}

fn check_line(check: &Check) -> String {
    format!("{} {}: {}", marker(check.passed), check.name, check.detail)
}

fn table_lines(table: &TableSummary) -> Vec<String> {
    vec![
        "Table:".to_string(),
        format!("  Location:  {}", table.location),
        format!(
            "  Metadata:  {} (v{})",
            table.metadata_location, table.metadata_version
        ),
        format!(
            "  Snapshot:  {} of {}",
            table
                .snapshot_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "none".into()),
            table.snapshot_count
        ),
        format!("  Schema:    {} [{}]", table.schema_id, table.columns.join(", ")),
        format!("  Records:   {}", table.record_count),
    ]
}

fn marker(ok: bool) -> &'static str {
    if ok {
        "[OK]"
    } else {
        "[FAIL]"
    }
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::AlreadyPresent => "already present",
        Action::Created => "created",
        Action::Deleted => "deleted",
        Action::AlreadyAbsent => "already absent",
        Action::Skipped => "skipped",
        Action::Failed => "failed",
        Action::Probed => "probed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icelink_core::provision::Resource;

    fn outcome(resource: Resource, state: ResourceState, action: Action) -> ResourceOutcome {
        ResourceOutcome {
            resource,
            state,
            action,
            blocked_by: None,
            detail: None,
            error: None,
        }
    }

    #[test]
    fn test_resource_lines() {
        let created = outcome(
            Resource::StorageLocation,
            ResourceState::Present,
            Action::Created,
        );
        assert_eq!(
            resource_line(&created),
            "[OK] storage_location: PRESENT (created)"
        );

        let mut skipped = outcome(
            Resource::ExternalTable,
            ResourceState::Absent,
            Action::Skipped,
        );
        skipped.blocked_by = Some(Resource::Connection);
        assert_eq!(
            resource_line(&skipped),
            "[FAIL] external_table: ABSENT (skipped), blocked by connection"
        );
    }

    #[test]
    fn test_check_line() {
        let check = Check {
            name: "row_count".into(),
            passed: true,
            detail: "2 = 2".into(),
        };
        assert_eq!(check_line(&check), "[OK] row_count: 2 = 2");
    }
}
