//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::audit::RunRecord;
use crate::fingerprint::{DiffClass, DiffResult};
use crate::planner::{ResourceKind, SyncResult};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Diff entry row for table display.
#[derive(Tabled)]
struct DiffRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Differs in")]
    detail: String,
}

/// Run record row for table display.
#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Migrated")]
    migrated: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Result")]
    result: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats per-kind diff results for display.
    #[must_use]
    pub fn format_diffs(&self, diffs: &[(ResourceKind, DiffResult)]) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: Vec<DiffJson> = diffs.iter().map(DiffJson::from).collect();
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_diffs_text(diffs),
        }
    }

    /// Formats diffs as text.
    fn format_diffs_text(diffs: &[(ResourceKind, DiffResult)]) -> String {
        let identical: usize = diffs.iter().map(|(_, d)| d.identical).sum();
        let new_in_source: usize = diffs.iter().map(|(_, d)| d.new_in_source).sum();
        let new_in_target: usize = diffs.iter().map(|(_, d)| d.new_in_target).sum();
        let changed: usize = diffs.iter().map(|(_, d)| d.changed).sum();

        if new_in_source + new_in_target + changed == 0 {
            return format!(
                "{} Environments match - {identical} resource(s), nothing to copy.\n",
                "✓".green()
            );
        }

        let mut output = String::from("\n📋 Environment diff\n\n");

        let rows: Vec<DiffRow> = diffs
            .iter()
            .flat_map(|(kind, diff)| {
                diff.actionable_entries().into_iter().map(move |entry| DiffRow {
                    kind: kind.to_string(),
                    resource: entry.name.clone(),
                    status: Self::format_class(entry.class),
                    detail: Self::truncate(
                        &entry
                            .details
                            .iter()
                            .map(|d| d.field.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        40,
                    ),
                })
            })
            .collect();

        if !rows.is_empty() {
            let table = Table::new(rows).to_string();
            output.push_str(&table);
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nDiff: {} only in source, {} changed, {} only in target, {} identical\n",
            new_in_source.to_string().green(),
            changed.to_string().yellow(),
            new_in_target.to_string().red(),
            identical
        );

        output
    }

    /// Formats a completed run record for display.
    #[must_use]
    pub fn format_record(&self, record: &RunRecord) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(record).unwrap_or_default(),
            OutputFormat::Text => Self::format_record_text(record),
        }
    }

    /// Formats a run record as text.
    fn format_record_text(record: &RunRecord) -> String {
        let mut output = format!(
            "\n📦 Sync {} -> {} ({} mode)\n\n",
            record.source, record.target, record.mode
        );

        for result in &record.results {
            let _ = writeln!(output, "   {result}");
            Self::append_result_details(&mut output, result);
        }

        let status = if record.is_success() {
            format!("{} success", "✓".green())
        } else {
            format!(
                "{} {} resource(s) failed",
                "✗".red(),
                record.total_failed()
            )
        };
        let _ = write!(
            output,
            "\nResult: {status} ({} migrated, run {})\n",
            record.total_migrated(),
            &record.run_id[..8.min(record.run_id.len())]
        );

        output
    }

    fn append_result_details(output: &mut String, result: &SyncResult) {
        if let Some(path) = &result.backup_path {
            let _ = writeln!(output, "      backup: {}", path.display());
        }
        for failed in &result.failed {
            let _ = writeln!(
                output,
                "      {} {}: {}",
                "✗".red(),
                failed.name,
                Self::truncate(&failed.error, 80)
            );
        }
        for blocked in &result.skipped_for_dependency {
            let _ = writeln!(
                output,
                "      {} {} blocked (missing {})",
                "⚠".yellow(),
                blocked.name,
                blocked.missing_imports.join(", ")
            );
        }
        for incompatible in &result.incompatible {
            let _ = writeln!(
                output,
                "      {} {} incompatible: {}",
                "⚠".yellow(),
                incompatible.name,
                Self::truncate(&incompatible.error, 80)
            );
        }
    }

    /// Formats a run history listing for display.
    #[must_use]
    pub fn format_runs(&self, runs: &[RunRecord]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(runs).unwrap_or_default(),
            OutputFormat::Text => Self::format_runs_text(runs),
        }
    }

    /// Formats run history as text.
    fn format_runs_text(runs: &[RunRecord]) -> String {
        let rows: Vec<RunRow> = runs
            .iter()
            .map(|record| RunRow {
                started: record.started_at.format("%Y-%m-%d %H:%M").to_string(),
                route: format!("{} -> {}", record.source, record.target),
                mode: record.mode.to_string(),
                migrated: record.total_migrated(),
                failed: record.total_failed(),
                result: if record.is_success() {
                    "ok".green().to_string()
                } else {
                    "failed".red().to_string()
                },
            })
            .collect();

        let mut output = String::from("\n💾 Recent sync runs\n\n");
        let table = Table::new(rows).to_string();
        output.push_str(&table);
        output.push('\n');
        output
    }

    /// Formats a diff class with color.
    fn format_class(class: DiffClass) -> String {
        match class {
            DiffClass::NewInSource => "+copy".green().to_string(),
            DiffClass::Changed => "~changed".yellow().to_string(),
            DiffClass::NewInTarget => "-target only".red().to_string(),
            DiffClass::Identical => "identical".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.len() <= max_len {
            s.to_string()
        } else {
            format!("{}...", &s[..max_len - 3])
        }
    }
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct DiffJson {
    kind: String,
    identical: usize,
    new_in_source: usize,
    new_in_target: usize,
    changed: usize,
    entries: Vec<DiffEntryJson>,
}

#[derive(serde::Serialize)]
struct DiffEntryJson {
    name: String,
    class: String,
    details: Vec<DiffDetailJson>,
}

#[derive(serde::Serialize)]
struct DiffDetailJson {
    field: String,
    source: Option<String>,
    target: Option<String>,
}

impl From<&(ResourceKind, DiffResult)> for DiffJson {
    fn from((kind, diff): &(ResourceKind, DiffResult)) -> Self {
        Self {
            kind: kind.to_string(),
            identical: diff.identical,
            new_in_source: diff.new_in_source,
            new_in_target: diff.new_in_target,
            changed: diff.changed,
            entries: diff
                .entries
                .iter()
                .map(|entry| DiffEntryJson {
                    name: entry.name.clone(),
                    class: class_tag(entry.class).to_string(),
                    details: entry
                        .details
                        .iter()
                        .map(|detail| DiffDetailJson {
                            field: detail.field.clone(),
                            source: detail.source_value.clone(),
                            target: detail.target_value.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Stable class tag for JSON consumers.
fn class_tag(class: DiffClass) -> &'static str {
    match class {
        DiffClass::Identical => "identical",
        DiffClass::NewInSource => "new-in-source",
        DiffClass::NewInTarget => "new-in-target",
        DiffClass::Changed => "changed",
    }
}
