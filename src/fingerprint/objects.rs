//! Storage bucket and object comparison.
//!
//! Buckets compare by visibility plus their object sets. Two objects are
//! the same when their etags match; backends that omit etags from list
//! output fall back to size plus the update timestamp normalized to whole
//! seconds. The fallback is an approximation and is the documented limit
//! of storage comparison accuracy.

use serde::Serialize;

use crate::remote::{BucketInfo, ObjectInfo};

use super::{DiffClass, DiffDetail, DiffEntry};

/// One side's snapshot of a single bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    /// The bucket itself.
    pub bucket: BucketInfo,
    /// Objects in key order. Empty when file comparison was not requested.
    pub objects: Vec<ObjectInfo>,
}

impl BucketSnapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(bucket: BucketInfo, objects: Vec<ObjectInfo>) -> Self {
        Self { bucket, objects }
    }

    fn object(&self, key: &str) -> Option<&ObjectInfo> {
        self.objects
            .binary_search_by(|o| o.key.as_str().cmp(key))
            .ok()
            .map(|i| &self.objects[i])
    }
}

/// Returns true when two listings describe the same stored content.
#[must_use]
pub fn objects_match(source: &ObjectInfo, target: &ObjectInfo) -> bool {
    if let (Some(s), Some(t)) = (&source.etag, &target.etag) {
        return s == t;
    }

    // No etag on at least one side; require size and second-normalized
    // timestamp to both agree
    match (
        source.size,
        target.size,
        source.updated_at,
        target.updated_at,
    ) {
        (Some(ss), Some(ts), Some(su), Some(tu)) => {
            ss == ts && su.timestamp() == tu.timestamp()
        }
        _ => false,
    }
}

/// Compares two snapshots of the same bucket.
pub fn compare_bucket_snapshots(
    name: &str,
    source: &BucketSnapshot,
    target: &BucketSnapshot,
) -> DiffEntry {
    let mut details = Vec::new();

    if source.bucket.public != target.bucket.public {
        details.push(DiffDetail::new(
            "visibility",
            Some(visibility(source.bucket.public).to_string()),
            Some(visibility(target.bucket.public).to_string()),
        ));
    }

    let mut only_in_source = 0usize;
    let mut differing = 0usize;
    for object in &source.objects {
        match target.object(&object.key) {
            None => only_in_source += 1,
            Some(other) if !objects_match(object, other) => differing += 1,
            Some(_) => {}
        }
    }
    let only_in_target = target
        .objects
        .iter()
        .filter(|o| source.object(&o.key).is_none())
        .count();

    if only_in_source > 0 {
        details.push(DiffDetail::new(
            "objects-only-in-source",
            Some(only_in_source.to_string()),
            None,
        ));
    }
    if only_in_target > 0 {
        details.push(DiffDetail::new(
            "objects-only-in-target",
            None,
            Some(only_in_target.to_string()),
        ));
    }
    if differing > 0 {
        details.push(DiffDetail::new(
            "objects-differing",
            Some(differing.to_string()),
            Some(differing.to_string()),
        ));
    }

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

const fn visibility(public: bool) -> &'static str {
    if public { "public" } else { "private" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ts(value: &str) -> Option<DateTime<Utc>> {
        Some(value.parse().unwrap())
    }

    fn object(key: &str, etag: Option<&str>, size: Option<u64>, updated: Option<&str>) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            etag: etag.map(String::from),
            size,
            updated_at: updated.and_then(ts),
            content_type: None,
        }
    }

    fn bucket(public: bool, objects: Vec<ObjectInfo>) -> BucketSnapshot {
        BucketSnapshot::new(
            BucketInfo {
                name: String::from("media"),
                public,
            },
            objects,
        )
    }

    #[test]
    fn test_etag_match_wins() {
        let a = object("x.png", Some("e1"), Some(100), None);
        let b = object("x.png", Some("e1"), Some(999), None);
        assert!(objects_match(&a, &b));

        let c = object("x.png", Some("e2"), Some(100), None);
        assert!(!objects_match(&a, &c));
    }

    #[test]
    fn test_size_and_timestamp_fallback() {
        let a = object("x.png", None, Some(100), Some("2026-08-20T10:00:00.120Z"));
        let b = object("x.png", None, Some(100), Some("2026-08-20T10:00:00.870Z"));
        assert!(objects_match(&a, &b));

        let c = object("x.png", None, Some(100), Some("2026-08-20T10:00:01.000Z"));
        assert!(!objects_match(&a, &c));

        let d = object("x.png", None, Some(101), Some("2026-08-20T10:00:00.120Z"));
        assert!(!objects_match(&a, &d));
    }

    #[test]
    fn test_missing_metadata_never_matches() {
        let a = object("x.png", None, Some(100), None);
        let b = object("x.png", None, Some(100), None);
        assert!(!objects_match(&a, &b));
    }

    #[test]
    fn test_identical_buckets() {
        let objects = vec![
            object("a.png", Some("e1"), Some(1), None),
            object("b.png", Some("e2"), Some(2), None),
        ];
        let entry = compare_bucket_snapshots(
            "media",
            &bucket(false, objects.clone()),
            &bucket(false, objects),
        );
        assert_eq!(entry.class, DiffClass::Identical);
    }

    #[test]
    fn test_visibility_difference() {
        let entry = compare_bucket_snapshots("media", &bucket(true, vec![]), &bucket(false, vec![]));
        assert_eq!(entry.class, DiffClass::Changed);
        assert_eq!(entry.details[0].field, "visibility");
        assert_eq!(entry.details[0].source_value.as_deref(), Some("public"));
    }

    #[test]
    fn test_object_set_differences_counted() {
        let source = bucket(
            false,
            vec![
                object("a.png", Some("e1"), None, None),
                object("b.png", Some("e2"), None, None),
                object("c.png", Some("e3"), None, None),
            ],
        );
        let target = bucket(
            false,
            vec![
                object("b.png", Some("changed"), None, None),
                object("d.png", Some("e4"), None, None),
            ],
        );

        let entry = compare_bucket_snapshots("media", &source, &target);
        assert_eq!(entry.class, DiffClass::Changed);

        let field = |name: &str| {
            entry
                .details
                .iter()
                .find(|d| d.field == name)
                .cloned()
                .unwrap()
        };
        assert_eq!(field("objects-only-in-source").source_value.as_deref(), Some("2"));
        assert_eq!(field("objects-only-in-target").target_value.as_deref(), Some("1"));
        assert_eq!(field("objects-differing").source_value.as_deref(), Some("1"));
    }

    #[test]
    fn test_empty_snapshots_compare_identical() {
        // File comparison disabled resolves to bucket existence only
        let entry = compare_bucket_snapshots("media", &bucket(false, vec![]), &bucket(false, vec![]));
        assert_eq!(entry.class, DiffClass::Identical);
    }
}
