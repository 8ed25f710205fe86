//! Function bundle handling.
//!
//! A bundle is the complete set of files behind one serverless function,
//! keyed by bundle-relative path. Bundles are loaded from deployed
//! functions over the wire or from local directories, and are compared and
//! deployed as a unit. Shared-dependency resolution lives in [`shared`].

mod shared;

pub use shared::{ResolutionOutcome, SharedFileResolver, SharedOrigin};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{BundleError, Result};

/// Directory names excluded from bundle loading and comparison. Build
/// output and VCS bookkeeping are not part of the deployable function.
pub const EXCLUDED_COMPONENTS: &[&str] = &["node_modules", "vendor", "dist", "build", ".git"];

/// Prefix marking files shared between functions.
pub const SHARED_PREFIX: &str = "_shared/";

/// Source file extensions scanned for shared-file imports.
const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs"];

/// Returns true when a path component must not enter a bundle.
#[must_use]
pub fn is_excluded_component(component: &str) -> bool {
    EXCLUDED_COMPONENTS.contains(&component)
}

/// The complete file set of one serverless function.
///
/// File paths are bundle-relative with forward slashes, held in key order
/// so listings and fingerprints are deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBundle {
    slug: String,
    files: BTreeMap<String, Vec<u8>>,
}

impl FunctionBundle {
    /// Creates an empty bundle for a function.
    #[must_use]
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            files: BTreeMap::new(),
        }
    }

    /// Loads a bundle from a local function directory, skipping build
    /// artifacts and VCS directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or a file cannot
    /// be read.
    pub fn from_dir(slug: impl Into<String>, dir: &Path) -> Result<Self> {
        let slug = slug.into();
        if !dir.is_dir() {
            return Err(BundleError::InvalidBundle {
                slug,
                message: format!("'{}' is not a directory", dir.display()),
            }
            .into());
        }

        let mut bundle = Self::new(slug);
        let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .is_none_or(|name| !is_excluded_component(name))
        });

        for entry in walker {
            let entry = entry.map_err(|e| BundleError::InvalidBundle {
                slug: bundle.slug.clone(),
                message: format!("Failed to walk '{}': {e}", dir.display()),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(dir).map_err(|e| {
                BundleError::InvalidBundle {
                    slug: bundle.slug.clone(),
                    message: format!("Unexpected path outside bundle root: {e}"),
                }
            })?;
            let name = normalize_path(relative);
            let content = std::fs::read(entry.path())?;
            bundle.files.insert(name, content);
        }

        debug!(slug = %bundle.slug, files = bundle.files.len(), "loaded bundle from directory");
        Ok(bundle)
    }

    /// The function slug this bundle belongs to.
    #[must_use]
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Adds or replaces one file.
    pub fn insert_file(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.files.insert(name.into(), content);
    }

    /// Content of one file, if present.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// All files in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(n, c)| (n.as_str(), c.as_slice()))
    }

    /// All file paths in order.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the bundle holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The shared files this bundle carries, in path order.
    pub fn shared_files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files()
            .filter(|(name, _)| name.starts_with(SHARED_PREFIX))
    }

    /// Shared-file paths referenced from the bundle's source files.
    ///
    /// Scans import statements for `_shared/<name>` references. Every
    /// returned path must exist in the deployed bundle or the function
    /// would fail at runtime.
    #[must_use]
    pub fn shared_imports(&self) -> BTreeSet<String> {
        let mut imports = BTreeSet::new();
        for (name, content) in &self.files {
            if !has_source_extension(name) {
                continue;
            }
            let text = String::from_utf8_lossy(content);
            collect_shared_references(&text, &mut imports);
        }
        imports
    }
}

/// Converts a relative filesystem path to a bundle key.
fn normalize_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn has_source_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Extracts `_shared/<path>` references from source text.
fn collect_shared_references(text: &str, imports: &mut BTreeSet<String>) {
    let mut rest = text;
    while let Some(start) = rest.find(SHARED_PREFIX) {
        let after = &rest[start + SHARED_PREFIX.len()..];
        let end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')))
            .unwrap_or(after.len());
        let captured = after[..end].trim_end_matches(['.', '/']);
        if !captured.is_empty() {
            imports.insert(format!("{SHARED_PREFIX}{captured}"));
        }
        rest = &after[end..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_excluded_components() {
        assert!(is_excluded_component("node_modules"));
        assert!(is_excluded_component(".git"));
        assert!(is_excluded_component("dist"));
        assert!(!is_excluded_component("src"));
        assert!(!is_excluded_component("_shared"));
    }

    #[test]
    fn test_from_dir_skips_artifacts() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "index.ts", b"export default 1;");
        write_file(dir.path(), "_shared/cors.ts", b"export const cors = {};");
        write_file(dir.path(), "node_modules/pkg/index.js", b"module.exports = {};");
        write_file(dir.path(), "dist/bundle.js", b"compiled");

        let bundle = FunctionBundle::from_dir("send-email", dir.path()).unwrap();

        assert_eq!(bundle.len(), 2);
        assert!(bundle.file("index.ts").is_some());
        assert!(bundle.file("_shared/cors.ts").is_some());
        assert!(bundle.file("node_modules/pkg/index.js").is_none());
        assert!(bundle.file("dist/bundle.js").is_none());
    }

    #[test]
    fn test_from_dir_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let error = FunctionBundle::from_dir("x", &missing).unwrap_err();
        assert!(error.to_string().contains("is not a directory"));
    }

    #[test]
    fn test_shared_imports_scanning() {
        let mut bundle = FunctionBundle::new("send-email");
        bundle.insert_file(
            "index.ts",
            b"import { cors } from '../_shared/cors.ts';\nimport helper from \"../_shared/util/helper.ts\";".to_vec(),
        );
        bundle.insert_file("README.md", b"see _shared/ignored.ts".to_vec());

        let imports = bundle.shared_imports();
        let expected: Vec<&str> = vec!["_shared/cors.ts", "_shared/util/helper.ts"];
        assert_eq!(imports.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_shared_imports_ignores_bare_prefix() {
        let mut bundle = FunctionBundle::new("f");
        bundle.insert_file("index.ts", b"const dir = '_shared/';".to_vec());
        assert!(bundle.shared_imports().is_empty());
    }

    #[test]
    fn test_shared_files_iterates_prefix_only() {
        let mut bundle = FunctionBundle::new("f");
        bundle.insert_file("index.ts", b"code".to_vec());
        bundle.insert_file("_shared/a.ts", b"a".to_vec());
        bundle.insert_file("_shared/b.ts", b"b".to_vec());

        let shared: Vec<&str> = bundle.shared_files().map(|(n, _)| n).collect();
        assert_eq!(shared, vec!["_shared/a.ts", "_shared/b.ts"]);
    }

    #[test]
    fn test_files_are_ordered() {
        let mut bundle = FunctionBundle::new("f");
        bundle.insert_file("z.ts", b"z".to_vec());
        bundle.insert_file("a.ts", b"a".to_vec());
        bundle.insert_file("m/n.ts", b"n".to_vec());

        let names: Vec<&str> = bundle.file_names().collect();
        assert_eq!(names, vec!["a.ts", "m/n.ts", "z.ts"]);
    }
}
