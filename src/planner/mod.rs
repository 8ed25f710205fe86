//! Planning module for sync operations.
//!
//! This module turns a comparison result into an ordered action plan and
//! executes that plan with partial-failure isolation, backup gating, and
//! cancellation.

mod executor;
mod plan;

pub use executor::{
    ActionHandler, FailedResource, OutcomeStatus, ResourceOutcome, SyncExecutor, SyncResult,
};
pub use plan::{
    ActionType, BlockedResource, PlannedAction, ResourceKind, SkipReason, SkippedResource,
    SyncMode, SyncPlan,
};
