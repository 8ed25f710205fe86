//! Run record types.
//!
//! Every engine run persists a record of what it did: which environments,
//! which mode, and the per-resource outcomes of every kind that ran. The
//! `runs` subcommand reads these back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::{SyncMode, SyncResult};

use super::lock::generate_holder_id;

/// Persisted record of one sync run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub run_id: String,
    /// Who performed the run.
    pub holder: String,
    /// Source environment name.
    pub source: String,
    /// Target environment name.
    pub target: String,
    /// Mode the run used.
    pub mode: SyncMode,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// One result per resource kind that ran.
    pub results: Vec<SyncResult>,
}

impl RunRecord {
    /// Starts a new record.
    #[must_use]
    pub fn new(source: &str, target: &str, mode: SyncMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            holder: generate_holder_id(),
            source: source.to_string(),
            target: target.to_string(),
            mode,
            started_at: now,
            finished_at: now,
            results: Vec::new(),
        }
    }

    /// Appends one kind's result.
    pub fn record_result(&mut self, result: SyncResult) {
        self.results.push(result);
    }

    /// Stamps the finish time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// True when every recorded kind succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().all(SyncResult::is_success)
    }

    /// Total resources migrated across all kinds.
    #[must_use]
    pub fn total_migrated(&self) -> usize {
        self.results.iter().map(|r| r.migrated.len()).sum()
    }

    /// Total resources failed across all kinds.
    #[must_use]
    pub fn total_failed(&self) -> usize {
        self.results.iter().map(|r| r.failed.len()).sum()
    }

    /// File name this record persists under.
    ///
    /// Timestamps use dashes in place of colons so the name is portable.
    #[must_use]
    pub fn file_name(&self) -> String {
        let stamp = self.started_at.format("%Y-%m-%dT%H-%M-%SZ");
        let short_id = &self.run_id[..8.min(self.run_id.len())];
        format!("run-{stamp}-{short_id}.json")
    }
}

impl std::fmt::Display for RunRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_success() { "ok" } else { "failed" };
        write!(
            f,
            "{} {} -> {} ({} mode, {} migrated, {} failed) [{status}]",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.source,
            self.target,
            self.mode,
            self.total_migrated(),
            self.total_failed()
        )
    }
}
