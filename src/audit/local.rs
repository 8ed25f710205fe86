//! Local file-based artifact storage backend.
//!
//! Runs, backups, and sync locks live under a `.envsync` directory next to
//! the configuration file. This is the only backend; the trait boundary
//! exists so a shared backend can be added without touching the engine.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ArtifactError, Result, SyncError};
use crate::planner::ResourceKind;

use super::lock::{generate_holder_id, lock_file_name, LockInfo, LOCK_EXPIRY_SECS};
use super::store::ArtifactStore;
use super::types::RunRecord;

/// Default artifact directory name.
const ARTIFACT_DIR: &str = ".envsync";

/// Subdirectory for run records.
const RUNS_DIR: &str = "runs";

/// Subdirectory for pre-sync backups.
const BACKUPS_DIR: &str = "backups";

/// Local file-based artifact store.
#[derive(Debug)]
pub struct LocalArtifactStore {
    /// Base directory for all artifacts.
    base_dir: PathBuf,
    /// Directory holding run records.
    runs_dir: PathBuf,
    /// Directory holding backups.
    backups_dir: PathBuf,
}

impl LocalArtifactStore {
    /// Creates a new local artifact store rooted in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| SyncError::internal(format!("Cannot determine current directory: {e}")))?
            .join(ARTIFACT_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local artifact store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let runs_dir = base_dir.join(RUNS_DIR);
        let backups_dir = base_dir.join(BACKUPS_DIR);

        Self {
            base_dir,
            runs_dir,
            backups_dir,
        }
    }

    /// Ensures a directory exists.
    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating artifact directory: {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                SyncError::Artifact(ArtifactError::WriteFailed {
                    message: format!("Failed to create directory {}: {e}", dir.display()),
                })
            })?;
        }
        Ok(())
    }

    /// Writes a file atomically via a temporary sibling and rename.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::WriteFailed {
                message: format!("Failed to create {}: {e}", temp_path.display()),
            })
        })?;

        file.write_all(content).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::WriteFailed {
                message: format!("Failed to write {}: {e}", temp_path.display()),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            SyncError::Artifact(ArtifactError::WriteFailed {
                message: format!("Failed to sync {}: {e}", temp_path.display()),
            })
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::WriteFailed {
                message: format!("Failed to rename into {}: {e}", path.display()),
            })
        })?;

        Ok(())
    }

    /// Path of the lock file for a target environment.
    fn lock_path(&self, target: &str) -> PathBuf {
        self.base_dir.join(lock_file_name(target))
    }

    /// Reads a target's lock file if it exists.
    async fn read_lock_file(&self, target: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(target);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            SyncError::Artifact(ArtifactError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Writes a target's lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        Self::ensure_dir(&self.base_dir).await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| ArtifactError::serialization(format!("Failed to serialize lock: {e}")))?;

        let path = self.lock_path(&lock_info.target);
        let mut file = fs::File::create(&path).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            SyncError::Artifact(ArtifactError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(())
    }

    /// Deletes a target's lock file.
    async fn delete_lock_file(&self, target: &str) -> Result<()> {
        let path = self.lock_path(target);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| {
                SyncError::Artifact(ArtifactError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn save_run(&self, record: &RunRecord) -> Result<PathBuf> {
        Self::ensure_dir(&self.runs_dir).await?;

        let path = self.runs_dir.join(record.file_name());
        info!("Saving run record to: {}", path.display());

        let content = serde_json::to_string_pretty(record).map_err(|e| {
            ArtifactError::serialization(format!("Failed to serialize run record: {e}"))
        })?;

        Self::write_atomic(&path, content.as_bytes()).await?;
        Ok(path)
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.runs_dir).await.map_err(|e| {
            SyncError::Artifact(ArtifactError::Corrupted {
                message: format!("Failed to read runs directory: {e}"),
            })
        })?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            SyncError::Artifact(ArtifactError::Corrupted {
                message: format!("Failed to read runs directory: {e}"),
            })
        })? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("run-") || !name.ends_with(".json") {
                continue;
            }

            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable run record {}: {e}", path.display());
                    continue;
                }
            };

            match serde_json::from_str::<RunRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping corrupted run record {}: {e}", path.display());
                }
            }
        }

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn write_backup(
        &self,
        target: &str,
        kind: ResourceKind,
        extension: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        Self::ensure_dir(&self.backups_dir).await?;

        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let path = self
            .backups_dir
            .join(format!("{target}-{kind}-{stamp}.{extension}"));

        info!("Writing backup to: {}", path.display());
        Self::write_atomic(&path, content).await?;
        Ok(path)
    }

    async fn acquire_lock(&self, target: &str, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file(target).await? {
            if !existing.is_expired() {
                return Err(SyncError::Artifact(ArtifactError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found for {target}, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(target, &holder_id);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired sync lock on {target}: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, target: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file(target).await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file(target).await?;
                info!("Released sync lock on {target}: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch on {target}: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn lock_info(&self, target: &str) -> Result<Option<LockInfo>> {
        self.read_lock_file(target).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
