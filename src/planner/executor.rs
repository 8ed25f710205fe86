//! Sync plan execution.
//!
//! This module runs a plan's actions in order through a kind-specific
//! [`ActionHandler`]. One resource failing never aborts the run; the
//! failure is recorded and the loop continues. The two exceptions are
//! credential rejection, which invalidates every remaining action against
//! the same environment, and cancellation, which stops the run between
//! resources.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{ErrorClass, Result};

use super::plan::{
    ActionType, BlockedResource, PlannedAction, ResourceKind, SkipReason, SkippedResource,
    SyncMode, SyncPlan,
};

/// Applies planned actions for one resource kind.
///
/// The engine provides one implementation per kind; the executor owns the
/// loop mechanics, backup gating, and result assembly.
#[async_trait]
pub trait ActionHandler: Send {
    /// Applies a single action.
    async fn apply(&mut self, action: &PlannedAction) -> Result<()>;

    /// Takes a pre-destructive backup of the target, returning its path.
    async fn backup(&mut self) -> Result<PathBuf>;
}

/// Final status of one executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// The action completed.
    Succeeded,
    /// The action failed or was interrupted.
    Failed,
}

/// One executed action with its result and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOutcome {
    /// Resource name.
    pub name: String,
    /// Action verb.
    pub action: ActionType,
    /// Final status.
    pub status: OutcomeStatus,
    /// Error message when failed.
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// A resource whose action failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedResource {
    /// Resource name.
    pub name: String,
    /// Error description.
    pub error: String,
    /// Error classification.
    pub class: ErrorClass,
}

/// Complete result of one sync run for one resource kind.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResult {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Mode the run used.
    pub mode: SyncMode,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Resources created or upserted.
    pub migrated: Vec<String>,
    /// Resources deleted (replace mode).
    pub deleted: Vec<String>,
    /// Resources whose action failed.
    pub failed: Vec<FailedResource>,
    /// Resources deliberately not acted on.
    pub skipped: Vec<SkippedResource>,
    /// Functions excluded for unresolved shared imports.
    pub skipped_for_dependency: Vec<BlockedResource>,
    /// Functions the target platform cannot run.
    pub incompatible: Vec<FailedResource>,
    /// Pre-destructive backup, when one was taken.
    pub backup_path: Option<PathBuf>,
    /// Every executed action in order.
    pub outcomes: Vec<ResourceOutcome>,
}

impl SyncResult {
    /// True when no action failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total resources the run touched or classified.
    #[must_use]
    pub fn total_resources(&self) -> usize {
        self.migrated.len()
            + self.deleted.len()
            + self.failed.len()
            + self.skipped.len()
            + self.skipped_for_dependency.len()
            + self.incompatible.len()
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sync ({} mode): {} migrated, {} deleted, {} failed, {} skipped",
            self.kind,
            self.mode,
            self.migrated.len(),
            self.deleted.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        if !self.skipped_for_dependency.is_empty() {
            write!(f, ", {} blocked", self.skipped_for_dependency.len())?;
        }
        if !self.incompatible.is_empty() {
            write!(f, ", {} incompatible", self.incompatible.len())?;
        }
        Ok(())
    }
}

/// Executor for sync plans.
#[derive(Debug)]
pub struct SyncExecutor {
    /// Whether the target environment is protected.
    protected_target: bool,
    /// Whether the operator opted out of the pre-destructive backup.
    skip_backup: bool,
    /// Cancellation signal, observed between resources and during actions.
    cancel: Option<watch::Receiver<bool>>,
}

impl SyncExecutor {
    /// Creates an executor with backups enabled and no cancellation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            protected_target: false,
            skip_backup: false,
            cancel: None,
        }
    }

    /// Marks the target environment as protected.
    #[must_use]
    pub const fn with_protected_target(mut self, protected: bool) -> Self {
        self.protected_target = protected;
        self
    }

    /// Opts out of the pre-destructive backup.
    #[must_use]
    pub const fn with_skip_backup(mut self, skip: bool) -> Self {
        self.skip_backup = skip;
        self
    }

    /// Attaches a cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Executes a plan.
    ///
    /// Always returns a complete [`SyncResult`]; per-resource failures are
    /// recorded, not propagated.
    ///
    /// # Errors
    ///
    /// Returns an error only when a required pre-destructive backup cannot
    /// be taken. Proceeding to delete from a protected environment without
    /// one is never acceptable.
    pub async fn execute(&self, plan: &SyncPlan, handler: &mut dyn ActionHandler) -> Result<SyncResult> {
        info!(
            kind = %plan.kind,
            mode = %plan.mode,
            actions = plan.actions.len(),
            "executing sync plan"
        );

        let mut result = SyncResult {
            kind: plan.kind,
            mode: plan.mode,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            migrated: Vec::new(),
            deleted: Vec::new(),
            failed: Vec::new(),
            skipped: plan.skipped.clone(),
            skipped_for_dependency: plan.blocked.clone(),
            incompatible: Vec::new(),
            backup_path: None,
            outcomes: Vec::new(),
        };

        if plan.has_destructive_actions() && self.protected_target && !self.skip_backup {
            info!(kind = %plan.kind, "taking pre-destructive backup of protected target");
            let path = handler.backup().await?;
            info!(path = %path.display(), "backup written");
            result.backup_path = Some(path);
        }

        let mut cancel = self.cancel.clone();
        let mut aborted: Option<SkipReason> = None;

        for action in &plan.actions {
            if aborted.is_none() && cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                aborted = Some(SkipReason::Cancelled);
            }
            if let Some(reason) = aborted {
                result.skipped.push(SkippedResource {
                    name: action.name.clone(),
                    reason,
                });
                continue;
            }

            let started = Instant::now();
            let applied = match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        r = handler.apply(action) => Some(r),
                        () = wait_for_cancel(rx) => None,
                    }
                }
                None => Some(handler.apply(action).await),
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match applied {
                Some(Ok(())) => {
                    info!(resource = %action.name, action = %action.action, "action succeeded");
                    if action.action == ActionType::Delete {
                        result.deleted.push(action.name.clone());
                    } else {
                        result.migrated.push(action.name.clone());
                    }
                    result.outcomes.push(ResourceOutcome {
                        name: action.name.clone(),
                        action: action.action,
                        status: OutcomeStatus::Succeeded,
                        error: None,
                        duration_ms,
                    });
                }
                Some(Err(e)) => {
                    let class = e.class();
                    error!(resource = %action.name, action = %action.action, error = %e, "action failed");
                    result.outcomes.push(ResourceOutcome {
                        name: action.name.clone(),
                        action: action.action,
                        status: OutcomeStatus::Failed,
                        error: Some(e.to_string()),
                        duration_ms,
                    });

                    let entry = FailedResource {
                        name: action.name.clone(),
                        error: e.to_string(),
                        class,
                    };
                    match class {
                        ErrorClass::Incompatible => result.incompatible.push(entry),
                        ErrorClass::Unauthorized => {
                            // Every remaining action would hit the same
                            // rejection
                            warn!(kind = %plan.kind, "credentials rejected, aborting remaining actions");
                            result.failed.push(entry);
                            aborted = Some(SkipReason::RunAborted);
                        }
                        _ => result.failed.push(entry),
                    }
                }
                None => {
                    warn!(resource = %action.name, "action cancelled mid-flight");
                    result.outcomes.push(ResourceOutcome {
                        name: action.name.clone(),
                        action: action.action,
                        status: OutcomeStatus::Failed,
                        error: Some(String::from("cancelled")),
                        duration_ms,
                    });
                    result.failed.push(FailedResource {
                        name: action.name.clone(),
                        error: String::from("cancelled"),
                        class: ErrorClass::Fatal,
                    });
                    aborted = Some(SkipReason::Cancelled);
                }
            }
        }

        result.finished_at = Utc::now();
        info!(kind = %plan.kind, "{result}");
        Ok(result)
    }
}

impl Default for SyncExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves only when cancellation is requested. Pends forever once the
/// sender side is gone, so a dropped sender never cancels a run.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
