//! Fingerprint comparison between two environments.
//!
//! This module classifies every resource of one kind by comparing the
//! source inventory against the target inventory. Inventories are fetched
//! once per side by the engine; everything here is pure computation over
//! those snapshots, so comparisons are deterministic and testable without
//! a network.

mod bundles;
mod objects;
mod rows;

pub use bundles::{compare_function_snapshots, tier1_verdict, FunctionSnapshot};
pub use objects::{compare_bucket_snapshots, objects_match, BucketSnapshot};
pub use rows::{compare_table_snapshots, row_digest, TableSnapshot};

use std::collections::{BTreeMap, BTreeSet};

/// Classification of one resource after comparing both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffClass {
    /// Present on both sides with matching content.
    Identical,
    /// Present only in the source environment.
    NewInSource,
    /// Present only in the target environment.
    NewInTarget,
    /// Present on both sides with differing content.
    Changed,
}

impl std::fmt::Display for DiffClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Identical => "identical",
            Self::NewInSource => "new in source",
            Self::NewInTarget => "new in target",
            Self::Changed => "changed",
        };
        write!(f, "{s}")
    }
}

/// One aspect in which a resource differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// What differs.
    pub field: String,
    /// Value on the source side.
    pub source_value: Option<String>,
    /// Value on the target side.
    pub target_value: Option<String>,
}

impl DiffDetail {
    /// Creates a detail with both sides.
    #[must_use]
    pub fn new(
        field: impl Into<String>,
        source_value: Option<String>,
        target_value: Option<String>,
    ) -> Self {
        Self {
            field: field.into(),
            source_value,
            target_value,
        }
    }
}

/// Comparison verdict for a single resource.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    /// Resource name (table, bucket, or function slug).
    pub name: String,
    /// Classification.
    pub class: DiffClass,
    /// Aspects that differ, empty for identical resources.
    pub details: Vec<DiffDetail>,
}

impl DiffEntry {
    /// Creates an entry with no details.
    #[must_use]
    pub fn new(name: impl Into<String>, class: DiffClass) -> Self {
        Self {
            name: name.into(),
            class,
            details: Vec::new(),
        }
    }

    /// Creates an entry for a resource whose snapshot could not be taken.
    ///
    /// Such a resource is treated as changed so the planner re-syncs it
    /// rather than silently assuming it matches.
    #[must_use]
    pub fn comparison_unavailable(
        name: impl Into<String>,
        source_failure: Option<String>,
        target_failure: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            class: DiffClass::Changed,
            details: vec![DiffDetail::new(
                "comparison-unavailable",
                source_failure,
                target_failure,
            )],
        }
    }
}

impl std::fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.class)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Complete comparison result for one resource kind.
#[derive(Debug)]
pub struct DiffResult {
    /// Per-resource verdicts in name order.
    pub entries: Vec<DiffEntry>,
    /// Number of identical resources.
    pub identical: usize,
    /// Number of resources only in the source.
    pub new_in_source: usize,
    /// Number of resources only in the target.
    pub new_in_target: usize,
    /// Number of changed resources.
    pub changed: usize,
}

impl DiffResult {
    /// Builds a result from entries, sorting by name and counting classes.
    #[must_use]
    pub fn from_entries(mut entries: Vec<DiffEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let count = |class: DiffClass| entries.iter().filter(|e| e.class == class).count();
        let identical = count(DiffClass::Identical);
        let new_in_source = count(DiffClass::NewInSource);
        let new_in_target = count(DiffClass::NewInTarget);
        let changed = count(DiffClass::Changed);
        Self {
            entries,
            identical,
            new_in_source,
            new_in_target,
            changed,
        }
    }

    /// Returns true if anything would be copied by an incremental sync.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.new_in_source > 0 || self.changed > 0
    }

    /// Number of resources an incremental sync would touch.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.new_in_source + self.changed
    }

    /// Entries that are not identical.
    #[must_use]
    pub fn actionable_entries(&self) -> Vec<&DiffEntry> {
        self.entries
            .iter()
            .filter(|e| e.class != DiffClass::Identical)
            .collect()
    }
}

/// One side's fetched resources of a single kind.
///
/// A resource that exists but whose snapshot failed is recorded as a
/// failure; comparison classifies it changed with the failure surfaced.
#[derive(Debug, Default)]
pub struct Inventory<T> {
    items: BTreeMap<String, T>,
    failures: BTreeMap<String, String>,
}

impl<T> Inventory<T> {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Records a successfully snapshotted resource.
    pub fn insert(&mut self, name: impl Into<String>, item: T) {
        self.items.insert(name.into(), item);
    }

    /// Records a resource that exists but could not be snapshotted.
    pub fn record_failure(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.failures.insert(name.into(), message.into());
    }

    /// Looks a snapshot up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&T> {
        self.items.get(name)
    }

    /// Mutable lookup, used when the engine fills tier-2 data in place.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.items.get_mut(name)
    }

    /// The snapshot failure for a name, if any.
    #[must_use]
    pub fn failure(&self, name: &str) -> Option<&str> {
        self.failures.get(name).map(String::as_str)
    }

    /// All known resource names, snapshotted or failed.
    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        self.items
            .keys()
            .chain(self.failures.keys())
            .cloned()
            .collect()
    }

    /// Snapshots in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.items.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Number of snapshotted resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing was snapshotted and nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.failures.is_empty()
    }
}

/// Compares two inventories of the same kind.
///
/// Walks the union of resource names in order. Resources present on one
/// side only classify new-in-source or new-in-target; resources present
/// on both sides are compared by `compare`; snapshot failures on either
/// side classify changed with the failure recorded.
pub fn compare_inventories<T>(
    source: &Inventory<T>,
    target: &Inventory<T>,
    compare: impl Fn(&str, &T, &T) -> DiffEntry,
) -> DiffResult {
    let mut names = source.names();
    names.extend(target.names());

    let mut entries = Vec::with_capacity(names.len());
    for name in &names {
        let source_failure = source.failure(name);
        let target_failure = target.failure(name);
        if source_failure.is_some() || target_failure.is_some() {
            entries.push(DiffEntry::comparison_unavailable(
                name.clone(),
                source_failure.map(String::from),
                target_failure.map(String::from),
            ));
            continue;
        }

        let entry = match (source.get(name), target.get(name)) {
            (Some(s), Some(t)) => compare(name, s, t),
            (Some(_), None) => DiffEntry::new(name.clone(), DiffClass::NewInSource),
            (None, Some(_)) => DiffEntry::new(name.clone(), DiffClass::NewInTarget),
            (None, None) => continue,
        };
        entries.push(entry);
    }

    DiffResult::from_entries(entries)
}
