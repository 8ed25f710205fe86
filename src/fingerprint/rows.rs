//! Row-level table comparison.
//!
//! Two tables compare over the intersection of their column sets. Columns
//! present on one side only are never compared and never copied; they are
//! surfaced in the diff detail so schema drift stays visible. Rows are
//! keyed by primary key and matched through a digest of the compared
//! column values.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::remote::{ColumnInfo, QualifiedTable, TableRow};

use super::{DiffClass, DiffDetail, DiffEntry};

/// One side's snapshot of a single table.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    /// Which table this is.
    pub table: QualifiedTable,
    /// Columns in declaration order.
    pub columns: Vec<ColumnInfo>,
    /// Rows in export order, values aligned with `columns`.
    pub rows: Vec<TableRow>,
}

impl TableSnapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(table: QualifiedTable, columns: Vec<ColumnInfo>, rows: Vec<TableRow>) -> Self {
        Self {
            table,
            columns,
            rows,
        }
    }

    /// Names of the primary-key columns, in declaration order.
    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Digest of one row restricted to the given column indexes.
///
/// NULL and empty string must not collide, so values are length-prefixed
/// before hashing.
#[must_use]
pub fn row_digest(row: &TableRow, indexes: &[usize]) -> String {
    let mut hasher = Sha256::new();
    for &index in indexes {
        match row.get(index).and_then(Option::as_deref) {
            Some(value) => {
                hasher.update(value.len().to_be_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update(u64::MAX.to_be_bytes()),
        }
    }
    hex::encode(hasher.finalize())
}

/// Compares two snapshots of the same table.
pub fn compare_table_snapshots(
    name: &str,
    source: &TableSnapshot,
    target: &TableSnapshot,
) -> DiffEntry {
    let mut details = Vec::new();

    // Columns compared are those both sides declare, in source order
    let shared: Vec<&str> = source
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|n| target.column_index(n).is_some())
        .collect();

    push_ignored_columns(&mut details, "columns-only-in-source", source, &shared, true);
    push_ignored_columns(&mut details, "columns-only-in-target", target, &shared, false);

    let source_indexes: Vec<usize> = shared
        .iter()
        .filter_map(|n| source.column_index(n))
        .collect();
    let target_indexes: Vec<usize> = shared
        .iter()
        .filter_map(|n| target.column_index(n))
        .collect();

    // Key by primary key where one exists, by the full compared tuple
    // otherwise
    let key_columns: Vec<&str> = {
        let pk: Vec<&str> = source
            .primary_key_columns()
            .into_iter()
            .filter(|n| shared.contains(n))
            .collect();
        if pk.is_empty() { shared.clone() } else { pk }
    };
    let source_key_indexes: Vec<usize> = key_columns
        .iter()
        .filter_map(|n| source.column_index(n))
        .collect();
    let target_key_indexes: Vec<usize> = key_columns
        .iter()
        .filter_map(|n| target.column_index(n))
        .collect();

    let source_rows = digest_rows(&source.rows, &source_key_indexes, &source_indexes);
    let target_rows = digest_rows(&target.rows, &target_key_indexes, &target_indexes);

    let mut only_in_source = 0usize;
    let mut only_in_target = 0usize;
    let mut differing = 0usize;

    for (key, digest) in &source_rows {
        match target_rows.get(key) {
            None => only_in_source += 1,
            Some(other) if other != digest => differing += 1,
            Some(_) => {}
        }
    }
    for key in target_rows.keys() {
        if !source_rows.contains_key(key) {
            only_in_target += 1;
        }
    }

    if only_in_source > 0 {
        details.push(DiffDetail::new(
            "rows-only-in-source",
            Some(only_in_source.to_string()),
            None,
        ));
    }
    if only_in_target > 0 {
        details.push(DiffDetail::new(
            "rows-only-in-target",
            None,
            Some(only_in_target.to_string()),
        ));
    }
    if differing > 0 {
        details.push(DiffDetail::new(
            "rows-differing",
            Some(differing.to_string()),
            Some(differing.to_string()),
        ));
    }

    // Ignored columns alone do not make a table changed; copy behavior
    // would be identical either way
    let class = if only_in_source > 0 || only_in_target > 0 || differing > 0 {
        DiffClass::Changed
    } else {
        DiffClass::Identical
    };

    DiffEntry {
        name: name.to_string(),
        class,
        details,
    }
}

fn digest_rows(
    rows: &[TableRow],
    key_indexes: &[usize],
    value_indexes: &[usize],
) -> BTreeMap<String, String> {
    rows.iter()
        .map(|row| {
            (
                row_digest(row, key_indexes),
                row_digest(row, value_indexes),
            )
        })
        .collect()
}

fn push_ignored_columns(
    details: &mut Vec<DiffDetail>,
    field: &str,
    snapshot: &TableSnapshot,
    shared: &[&str],
    on_source_side: bool,
) {
    let ignored: Vec<&str> = snapshot
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|n| !shared.contains(n))
        .collect();
    if ignored.is_empty() {
        return;
    }

    let listed = ignored.join(", ");
    if on_source_side {
        details.push(DiffDetail::new(field, Some(listed), None));
    } else {
        details.push(DiffDetail::new(field, None, Some(listed)));
    }
}
