//! Function bundle comparison.
//!
//! Tier 1 compares the deployment metadata both sides declare: version and
//! last-update time. A conclusive tier-1 verdict avoids downloading any
//! code. Tier 2 runs when tier 1 is inconclusive or full accuracy was
//! requested: both bundles are compared file by file, byte for byte,
//! ignoring build artifacts and VCS directories. A bundle differing in a
//! single byte of a single file classifies changed.

use crate::bundle::{is_excluded_component, FunctionBundle};
use crate::remote::FunctionInfo;

use super::{DiffClass, DiffDetail, DiffEntry};

/// One side's snapshot of a single function.
#[derive(Debug, Clone)]
pub struct FunctionSnapshot {
    /// Deployment metadata from the listing.
    pub info: FunctionInfo,
    /// Downloaded bundle, filled only when tier 2 needs it.
    pub bundle: Option<FunctionBundle>,
}

impl FunctionSnapshot {
    /// Creates a snapshot from listing metadata.
    #[must_use]
    pub fn new(info: FunctionInfo) -> Self {
        Self { info, bundle: None }
    }
}

/// Metadata-only verdict. `Some(true)` means identical, `Some(false)`
/// changed, `None` inconclusive (tier 2 required).
#[must_use]
pub fn tier1_verdict(source: &FunctionInfo, target: &FunctionInfo) -> Option<bool> {
    let (Some(source_updated), Some(target_updated)) = (source.updated_at, target.updated_at)
    else {
        return None;
    };
    Some(
        source.version == target.version
            && source_updated.timestamp() == target_updated.timestamp(),
    )
}

/// Compares two snapshots of the same function.
pub fn compare_function_snapshots(
    name: &str,
    source: &FunctionSnapshot,
    target: &FunctionSnapshot,
    full_compare: bool,
) -> DiffEntry {
    if !full_compare
        && let Some(identical) = tier1_verdict(&source.info, &target.info)
    {
        if identical {
            return DiffEntry::new(name, DiffClass::Identical);
        }

        let mut entry = DiffEntry::new(name, DiffClass::Changed);
        if source.info.version != target.info.version {
            entry.details.push(DiffDetail::new(
                "version",
                Some(source.info.version.to_string()),
                Some(target.info.version.to_string()),
            ));
        }
        if source.info.updated_at != target.info.updated_at {
            entry.details.push(DiffDetail::new(
                "updated-at",
                source.info.updated_at.map(|t| t.to_rfc3339()),
                target.info.updated_at.map(|t| t.to_rfc3339()),
            ));
        }
        return entry;
    }

    match (&source.bundle, &target.bundle) {
        (Some(s), Some(t)) => {
            let details = compare_bundles(s, t);
            let class = if details.is_empty() {
                DiffClass::Identical
            } else {
                DiffClass::Changed
            };
            DiffEntry {
                name: name.to_string(),
                class,
                details,
            }
        }
        _ => DiffEntry {
            name: name.to_string(),
            class: DiffClass::Changed,
            details: vec![DiffDetail::new(
                "bundle-unavailable",
                source.bundle.is_none().then(|| String::from("not downloaded")),
                target.bundle.is_none().then(|| String::from("not downloaded")),
            )],
        },
    }
}

/// File-level differences between two bundles, artifacts excluded.
fn compare_bundles(source: &FunctionBundle, target: &FunctionBundle) -> Vec<DiffDetail> {
    let mut details = Vec::new();

    let source_names: Vec<&str> = source.file_names().filter(|n| is_comparable(n)).collect();
    let target_names: Vec<&str> = target.file_names().filter(|n| is_comparable(n)).collect();

    let only_in_source: Vec<&str> = source_names
        .iter()
        .filter(|n| !target_names.contains(n))
        .copied()
        .collect();
    let only_in_target: Vec<&str> = target_names
        .iter()
        .filter(|n| !source_names.contains(n))
        .copied()
        .collect();
    let differing: Vec<&str> = source_names
        .iter()
        .filter(|n| {
            target_names.contains(n)
                && source.file(n) != target.file(n)
        })
        .copied()
        .collect();

    if !only_in_source.is_empty() {
        details.push(DiffDetail::new(
            "files-only-in-source",
            Some(only_in_source.join(", ")),
            None,
        ));
    }
    if !only_in_target.is_empty() {
        details.push(DiffDetail::new(
            "files-only-in-target",
            None,
            Some(only_in_target.join(", ")),
        ));
    }
    if !differing.is_empty() {
        let listed = differing.join(", ");
        details.push(DiffDetail::new(
            "files-differing",
            Some(listed.clone()),
            Some(listed),
        ));
    }

    details
}

fn is_comparable(name: &str) -> bool {
    !name.split('/').any(is_excluded_component)
}
