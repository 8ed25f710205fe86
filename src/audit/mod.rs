//! Run artifact module for the envsync engine.
//!
//! This module persists what every sync run did: run records for the `runs`
//! subcommand, pre-sync backups of the target, and per-target lock files
//! that stop two runs from writing into the same environment at once.

mod local;
mod lock;
mod store;
mod types;

pub use local::LocalArtifactStore;
pub use lock::{generate_holder_id, lock_file_name, LockInfo, LOCK_EXPIRY_SECS};
pub use store::ArtifactStore;
pub use types::RunRecord;
