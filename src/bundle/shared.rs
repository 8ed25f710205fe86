//! Shared-file resolution for function bundles.
//!
//! Functions import common code from `_shared/` paths that the deployment
//! API does not manage as a separate resource. Before deploying, every
//! imported shared file must be present in the bundle. Resolution walks
//! four tiers in order, first found wins:
//!
//! 1. the run-scoped cache (files already resolved for earlier functions
//!    in the same run),
//! 2. configured local shared directories,
//! 3. the function's own bundled `_shared` files,
//! 4. shared files harvested from other downloaded bundles
//!    ([`SharedFileResolver::absorb_bundle`], driven by the engine as a
//!    last resort).
//!
//! A function with unresolved imports is never deployed.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{FunctionBundle, SHARED_PREFIX};
use crate::error::Result;

/// Where a shared file was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedOrigin {
    /// Resolved for an earlier function in this run.
    RunCache,
    /// Read from a configured shared directory.
    SharedDir(PathBuf),
    /// Already present in the function's own bundle.
    OwnBundle,
    /// Harvested from another function's downloaded bundle.
    InventoryScan,
}

impl std::fmt::Display for SharedOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RunCache => write!(f, "run cache"),
            Self::SharedDir(dir) => write!(f, "shared dir {}", dir.display()),
            Self::OwnBundle => write!(f, "own bundle"),
            Self::InventoryScan => write!(f, "inventory scan"),
        }
    }
}

/// Result of resolving one bundle's shared imports.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// Resolved shared paths with their origins, in path order.
    pub resolved: BTreeMap<String, SharedOrigin>,
    /// Imported shared paths no tier could provide.
    pub missing: Vec<String>,
}

impl ResolutionOutcome {
    /// True when every import was satisfied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone)]
struct CachedShared {
    content: Vec<u8>,
    origin: SharedOrigin,
}

/// Run-scoped shared-file resolver.
///
/// One resolver lives for the duration of a function sync run so that all
/// functions deployed in that run receive the same copy of each shared
/// file.
#[derive(Debug, Default)]
pub struct SharedFileResolver {
    shared_dirs: Vec<PathBuf>,
    cache: BTreeMap<String, CachedShared>,
}

impl SharedFileResolver {
    /// Creates a resolver over the configured shared directories.
    #[must_use]
    pub fn new(shared_dirs: Vec<PathBuf>) -> Self {
        Self {
            shared_dirs,
            cache: BTreeMap::new(),
        }
    }

    /// Number of files currently cached for this run.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Resolves every shared import of `bundle`, inserting the winning
    /// copy of each file into the bundle.
    ///
    /// Later tiers only fill gaps. Files that resolve are also cached so
    /// subsequent functions in the run reuse them.
    ///
    /// # Errors
    ///
    /// Returns an error only when a shared directory exists but cannot be
    /// read. Absent files are reported through
    /// [`ResolutionOutcome::missing`], not as errors.
    pub fn resolve(&mut self, bundle: &mut FunctionBundle) -> Result<ResolutionOutcome> {
        let mut outcome = ResolutionOutcome::default();

        for name in bundle.shared_imports() {
            if let Some(cached) = self.cache.get(&name) {
                bundle.insert_file(name.clone(), cached.content.clone());
                outcome.resolved.insert(name, cached.origin.clone());
                continue;
            }

            if let Some((dir, content)) = self.read_from_shared_dirs(&name)? {
                bundle.insert_file(name.clone(), content.clone());
                self.cache.insert(
                    name.clone(),
                    CachedShared {
                        content,
                        origin: SharedOrigin::RunCache,
                    },
                );
                outcome.resolved.insert(name, SharedOrigin::SharedDir(dir));
                continue;
            }

            if let Some(content) = bundle.file(&name) {
                self.cache.insert(
                    name.clone(),
                    CachedShared {
                        content: content.to_vec(),
                        origin: SharedOrigin::RunCache,
                    },
                );
                outcome.resolved.insert(name, SharedOrigin::OwnBundle);
                continue;
            }

            outcome.missing.push(name);
        }

        if outcome.missing.is_empty() {
            debug!(
                slug = bundle.slug(),
                resolved = outcome.resolved.len(),
                "shared imports resolved"
            );
        } else {
            warn!(
                slug = bundle.slug(),
                missing = ?outcome.missing,
                "shared imports unresolved"
            );
        }
        Ok(outcome)
    }

    /// Harvests another bundle's shared files into the run cache without
    /// displacing anything already cached.
    pub fn absorb_bundle(&mut self, bundle: &FunctionBundle) {
        for (name, content) in bundle.shared_files() {
            if !self.cache.contains_key(name) {
                self.cache.insert(
                    name.to_string(),
                    CachedShared {
                        content: content.to_vec(),
                        origin: SharedOrigin::InventoryScan,
                    },
                );
            }
        }
    }

    /// Looks a shared path up in the configured directories, in order.
    fn read_from_shared_dirs(&self, name: &str) -> Result<Option<(PathBuf, Vec<u8>)>> {
        let Some(relative) = name.strip_prefix(SHARED_PREFIX) else {
            return Ok(None);
        };

        for dir in &self.shared_dirs {
            let candidate = dir.join(Path::new(relative));
            match std::fs::read(&candidate) {
                Ok(content) => return Ok(Some((dir.clone(), content))),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}
