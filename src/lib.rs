// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Envsync
//!
//! A declarative synchronization engine for `Supabase` project environments.
//!
//! ## Overview
//!
//! Envsync copies logical state between named environments of the same
//! project, allowing you to:
//!
//! - Describe your environments once in a YAML configuration file
//! - Diff tables, storage buckets, and edge functions before touching anything
//! - Sync incrementally (additive) or as a full replace of the target
//! - Keep protected environments safe with backups and confirmation gates
//! - Track every run with persisted records and per-target locks
//!
//! ## Architecture
//!
//! The system is built around **inventory comparison**:
//!
//! 1. **Inventories**: Snapshotted from source and target over their channels
//! 2. **Fingerprints**: Cheap digests decide what actually differs
//! 3. **Plan**: Differences become an ordered, destructive-gated action list
//! 4. **Executor**: Applies actions with per-resource failure isolation
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`remote`]: Database, storage, and function channels with failover
//! - [`fingerprint`]: Inventory snapshots and diff classification
//! - [`bundle`]: Function bundles and shared-file resolution
//! - [`planner`]: Plan construction and execution
//! - [`engine`]: End-to-end sync orchestration
//! - [`audit`]: Run records, backups, and target locking
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! version: "1"
//! project: my-app
//!
//! environments:
//!   - name: staging
//!     project_ref: abcdefghijklmnopqrst
//!     region: eu-west-1
//!   - name: prod
//!     project_ref: tsrqponmlkjihgfedcba
//!     region: eu-west-1
//!     protected: true
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod audit;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod planner;
pub mod remote;

// ============================================================================
// Re-exports
// ============================================================================

pub use audit::{ArtifactStore, LocalArtifactStore, RunRecord};
pub use bundle::{FunctionBundle, SharedFileResolver};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, SyncConfig};
pub use engine::{EnvironmentHandle, SyncEngine, SyncRequest};
pub use error::{Result, SyncError};
pub use fingerprint::{DiffClass, DiffEntry, DiffResult, Inventory};
pub use planner::{ResourceKind, SyncExecutor, SyncMode, SyncPlan, SyncResult};
pub use remote::{
    ConnectionEndpoint, DatabaseChannel, EndpointResolver, FunctionChannel,
    HttpFunctionChannel, HttpStorageChannel, PgCommandChannel, RemoteExecutor, StorageChannel,
};
