//! Artifact store trait definition.
//!
//! This module defines the common interface for run artifact backends.

use std::path::PathBuf;

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::RunRecord;
use crate::error::Result;
use crate::planner::ResourceKind;

/// Trait for run artifact backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persists a run record.
    ///
    /// Returns the path the record was written to.
    async fn save_run(&self, record: &RunRecord) -> Result<PathBuf>;

    /// Lists persisted run records, newest first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;

    /// Writes a pre-sync backup for a target environment.
    ///
    /// Returns the path the backup was written to.
    async fn write_backup(
        &self,
        target: &str,
        kind: ResourceKind,
        extension: &str,
        content: &[u8],
    ) -> Result<PathBuf>;

    /// Acquires the per-target sync lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, target: &str, holder: &str) -> Result<LockInfo>;

    /// Releases the per-target sync lock.
    async fn release_lock(&self, target: &str, lock_id: &str) -> Result<()>;

    /// Gets current lock information for a target if locked.
    async fn lock_info(&self, target: &str) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl ArtifactStore for Box<dyn ArtifactStore> {
    async fn save_run(&self, record: &RunRecord) -> Result<PathBuf> {
        (**self).save_run(record).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        (**self).list_runs(limit).await
    }

    async fn write_backup(
        &self,
        target: &str,
        kind: ResourceKind,
        extension: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        (**self).write_backup(target, kind, extension, content).await
    }

    async fn acquire_lock(&self, target: &str, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(target, holder).await
    }

    async fn release_lock(&self, target: &str, lock_id: &str) -> Result<()> {
        (**self).release_lock(target, lock_id).await
    }

    async fn lock_info(&self, target: &str) -> Result<Option<LockInfo>> {
        (**self).lock_info(target).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
