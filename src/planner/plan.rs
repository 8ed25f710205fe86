//! Sync plan types and construction.
//!
//! This module converts a comparison result into an ordered list of
//! actions. Incremental plans never contain deletes; replace plans queue
//! their deletes before any create so the target is an exact mirror when
//! the plan finishes. The planner refuses to emit destructive actions
//! unless the caller passed the explicit confirmation option.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::fingerprint::{DiffClass, DiffResult};

/// Which resource kind a plan or result covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Database tables and their rows.
    Tables,
    /// Storage buckets and their objects.
    Storage,
    /// Serverless functions.
    Functions,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tables => "tables",
            Self::Storage => "storage",
            Self::Functions => "functions",
        };
        write!(f, "{s}")
    }
}

/// How a sync treats the target environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Copy what the target is missing; never delete anything.
    Incremental,
    /// Make the target an exact mirror of the source, deletes included.
    Replace,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Incremental => "incremental",
            Self::Replace => "replace",
        };
        write!(f, "{s}")
    }
}

/// Verb of a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a resource absent from the target.
    Create,
    /// Copy content into a resource that already exists on the target.
    Upsert,
    /// Remove a resource from the target. Replace mode only.
    Delete,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// A single planned action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    /// Action verb.
    pub action: ActionType,
    /// Resource name.
    pub name: String,
    /// Why this action was planned.
    pub reason: String,
}

impl PlannedAction {
    /// True when the action removes something from the target.
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        self.action == ActionType::Delete
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

/// Why a resource was left out of the actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Both sides already match.
    Identical,
    /// Present only on the target; incremental mode preserves it.
    TargetOnly,
    /// The run was cancelled before this resource started.
    Cancelled,
    /// The run aborted before this resource started, for instance after
    /// a credential rejection.
    RunAborted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Identical => "identical",
            Self::TargetOnly => "target only",
            Self::Cancelled => "cancelled",
            Self::RunAborted => "run aborted",
        };
        write!(f, "{s}")
    }
}

/// A resource deliberately not acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedResource {
    /// Resource name.
    pub name: String,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// A function excluded because its shared imports could not be satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedResource {
    /// Function slug.
    pub name: String,
    /// Shared paths no tier could provide.
    pub missing_imports: Vec<String>,
}

/// A complete, ordered sync plan for one resource kind.
#[derive(Debug)]
pub struct SyncPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Resource kind this plan covers.
    pub kind: ResourceKind,
    /// Mode the plan was built for.
    pub mode: SyncMode,
    /// Actions in execution order, deletes before creates.
    pub actions: Vec<PlannedAction>,
    /// Resources deliberately not acted on.
    pub skipped: Vec<SkippedResource>,
    /// Functions excluded for unresolved shared imports.
    pub blocked: Vec<BlockedResource>,
}

impl SyncPlan {
    /// Builds a plan from a comparison result.
    ///
    /// `blocked` names functions whose shared imports could not be
    /// resolved; they are excluded from every action, deletes included,
    /// so a target copy is never destroyed without a deployable
    /// replacement.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DestructiveNotAllowed`] when the plan would
    /// contain deletes and `allow_destructive` is false.
    pub fn from_diff(
        kind: ResourceKind,
        diff: &DiffResult,
        mode: SyncMode,
        allow_destructive: bool,
        blocked: Vec<BlockedResource>,
    ) -> Result<Self, PlanError> {
        let mut actions = Vec::new();
        let mut skipped = Vec::new();

        let is_blocked =
            |name: &str| blocked.iter().any(|b| b.name == name);

        match mode {
            SyncMode::Incremental => {
                for entry in &diff.entries {
                    if is_blocked(&entry.name) {
                        continue;
                    }
                    match entry.class {
                        DiffClass::NewInSource => actions.push(PlannedAction {
                            action: ActionType::Create,
                            name: entry.name.clone(),
                            reason: String::from("new in source"),
                        }),
                        DiffClass::Changed => actions.push(PlannedAction {
                            action: ActionType::Upsert,
                            name: entry.name.clone(),
                            reason: String::from("content differs"),
                        }),
                        DiffClass::Identical => skipped.push(SkippedResource {
                            name: entry.name.clone(),
                            reason: SkipReason::Identical,
                        }),
                        DiffClass::NewInTarget => skipped.push(SkippedResource {
                            name: entry.name.clone(),
                            reason: SkipReason::TargetOnly,
                        }),
                    }
                }
            }
            SyncMode::Replace => {
                // Deletes first. For functions the whole target set is
                // removed so the redeployed set mirrors the source
                // exactly; other kinds only delete target-only resources.
                for entry in &diff.entries {
                    if is_blocked(&entry.name) {
                        continue;
                    }
                    let delete = match kind {
                        ResourceKind::Functions => entry.class != DiffClass::NewInSource,
                        ResourceKind::Tables | ResourceKind::Storage => {
                            entry.class == DiffClass::NewInTarget
                        }
                    };
                    if delete {
                        actions.push(PlannedAction {
                            action: ActionType::Delete,
                            name: entry.name.clone(),
                            reason: String::from("replace mode mirror"),
                        });
                    }
                }

                for entry in &diff.entries {
                    if is_blocked(&entry.name) || entry.class == DiffClass::NewInTarget {
                        continue;
                    }
                    let action = match kind {
                        // Target copies were deleted above
                        ResourceKind::Functions => ActionType::Create,
                        ResourceKind::Tables | ResourceKind::Storage => {
                            if entry.class == DiffClass::NewInSource {
                                ActionType::Create
                            } else {
                                ActionType::Upsert
                            }
                        }
                    };
                    actions.push(PlannedAction {
                        action,
                        name: entry.name.clone(),
                        reason: String::from("replace mode re-copy"),
                    });
                }
            }
        }

        let deletes = actions.iter().filter(|a| a.is_destructive()).count();
        if deletes > 0 && !allow_destructive {
            return Err(PlanError::DestructiveNotAllowed {
                message: format!(
                    "{deletes} delete action(s) in {kind} plan require confirmation"
                ),
            });
        }

        Ok(Self {
            created_at: Utc::now(),
            kind,
            mode,
            actions,
            skipped,
            blocked,
        })
    }

    /// True when nothing would run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of planned actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Number of create actions.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ActionType::Create)
    }

    /// Number of upsert actions.
    #[must_use]
    pub fn upsert_count(&self) -> usize {
        self.count(ActionType::Upsert)
    }

    /// Number of delete actions.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ActionType::Delete)
    }

    /// True when the plan removes anything from the target.
    #[must_use]
    pub fn has_destructive_actions(&self) -> bool {
        self.actions.iter().any(PlannedAction::is_destructive)
    }

    fn count(&self, action: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action == action).count()
    }
}

impl std::fmt::Display for SyncPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            write!(f, "No changes required for {}", self.kind)?;
        } else {
            writeln!(
                f,
                "Sync plan for {} ({} mode, {} actions):",
                self.kind,
                self.mode,
                self.actions.len()
            )?;
            for (i, action) in self.actions.iter().enumerate() {
                writeln!(f, "  {}. {action}", i + 1)?;
            }
        }

        if !self.blocked.is_empty() {
            writeln!(f)?;
            writeln!(f, "Blocked (unresolved shared imports):")?;
            for blocked in &self.blocked {
                writeln!(f, "  - {} (missing: {})", blocked.name, blocked.missing_imports.join(", "))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::DiffEntry;

    fn diff(entries: Vec<(&str, DiffClass)>) -> DiffResult {
        DiffResult::from_entries(
            entries
                .into_iter()
                .map(|(name, class)| DiffEntry::new(name, class))
                .collect(),
        )
    }

    #[test]
    fn test_incremental_classification() {
        let diff = diff(vec![
            ("a", DiffClass::NewInSource),
            ("b", DiffClass::Changed),
            ("c", DiffClass::Identical),
            ("d", DiffClass::NewInTarget),
        ]);

        let plan =
            SyncPlan::from_diff(ResourceKind::Tables, &diff, SyncMode::Incremental, false, vec![])
                .unwrap();

        assert_eq!(plan.create_count(), 1);
        assert_eq!(plan.upsert_count(), 1);
        assert_eq!(plan.delete_count(), 0);
        assert_eq!(plan.actions[0].name, "a");
        assert_eq!(plan.actions[1].name, "b");

        let skip_names: Vec<&str> = plan.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skip_names, vec!["c", "d"]);
        assert_eq!(plan.skipped[1].reason, SkipReason::TargetOnly);
    }

    #[test]
    fn test_incremental_never_deletes() {
        let diff = diff(vec![
            ("only-on-target", DiffClass::NewInTarget),
            ("another", DiffClass::NewInTarget),
        ]);

        let plan =
            SyncPlan::from_diff(ResourceKind::Storage, &diff, SyncMode::Incremental, true, vec![])
                .unwrap();

        assert!(plan.is_empty());
        assert!(!plan.has_destructive_actions());
    }

    #[test]
    fn test_replace_refused_without_confirmation() {
        let diff = diff(vec![("orphan", DiffClass::NewInTarget)]);

        let error =
            SyncPlan::from_diff(ResourceKind::Tables, &diff, SyncMode::Replace, false, vec![])
                .unwrap_err();
        assert!(matches!(error, PlanError::DestructiveNotAllowed { .. }));
    }

    #[test]
    fn test_replace_deletes_before_creates() {
        let diff = diff(vec![
            ("kept", DiffClass::Identical),
            ("orphan", DiffClass::NewInTarget),
            ("fresh", DiffClass::NewInSource),
        ]);

        let plan = SyncPlan::from_diff(ResourceKind::Tables, &diff, SyncMode::Replace, true, vec![])
            .unwrap();

        assert_eq!(plan.actions[0].action, ActionType::Delete);
        assert_eq!(plan.actions[0].name, "orphan");
        // Identical resource is re-copied, not skipped
        assert!(plan
            .actions
            .iter()
            .any(|a| a.name == "kept" && a.action == ActionType::Upsert));
        assert!(plan
            .actions
            .iter()
            .any(|a| a.name == "fresh" && a.action == ActionType::Create));
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_function_replace_mirrors_exactly() {
        let diff = diff(vec![
            ("shared-slug", DiffClass::Identical),
            ("target-only", DiffClass::NewInTarget),
            ("source-only", DiffClass::NewInSource),
        ]);

        let plan =
            SyncPlan::from_diff(ResourceKind::Functions, &diff, SyncMode::Replace, true, vec![])
                .unwrap();

        // Every target function deleted, every source function deployed
        let deletes: Vec<&str> = plan
            .actions
            .iter()
            .filter(|a| a.action == ActionType::Delete)
            .map(|a| a.name.as_str())
            .collect();
        let creates: Vec<&str> = plan
            .actions
            .iter()
            .filter(|a| a.action == ActionType::Create)
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(deletes, vec!["shared-slug", "target-only"]);
        assert_eq!(creates, vec!["shared-slug", "source-only"]);

        // All deletes precede all creates
        let first_create = plan
            .actions
            .iter()
            .position(|a| a.action == ActionType::Create)
            .unwrap();
        assert!(plan.actions[..first_create]
            .iter()
            .all(|a| a.action == ActionType::Delete));
    }

    #[test]
    fn test_blocked_functions_fully_excluded() {
        let diff = diff(vec![
            ("deployable", DiffClass::Changed),
            ("broken", DiffClass::Changed),
        ]);
        let blocked = vec![BlockedResource {
            name: String::from("broken"),
            missing_imports: vec![String::from("_shared/cors.ts")],
        }];

        let plan = SyncPlan::from_diff(
            ResourceKind::Functions,
            &diff,
            SyncMode::Replace,
            true,
            blocked,
        )
        .unwrap();

        assert!(plan.actions.iter().all(|a| a.name != "broken"));
        assert_eq!(plan.blocked.len(), 1);
        assert_eq!(plan.blocked[0].missing_imports, vec!["_shared/cors.ts"]);
    }

    #[test]
    fn test_empty_diff_empty_plan() {
        let plan = SyncPlan::from_diff(
            ResourceKind::Tables,
            &DiffResult::from_entries(vec![]),
            SyncMode::Incremental,
            false,
            vec![],
        )
        .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.action_count(), 0);
    }
}
