//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of configuration structures
//! so run records can state exactly which configuration a sync ran under
//! and repeated runs can be correlated.

use sha2::{Digest, Sha256};

use super::spec::{EnvironmentSpec, SyncConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire sync configuration.
    ///
    /// This hash changes when any part of the configuration changes.
    /// Credentials never contribute; they live outside the config file.
    #[must_use]
    pub fn hash_config(&self, config: &SyncConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.version.as_bytes());
        hasher.update(config.project.as_bytes());

        // BTreeMap iteration is already name-ordered
        for (name, spec) in &config.environments {
            hasher.update(self.hash_environment(name, spec).as_bytes());
        }

        let retry = &config.settings.retry;
        hasher.update(retry.max_attempts.to_be_bytes());
        hasher.update(retry.initial_delay_ms.to_be_bytes());
        hasher.update(retry.backoff_multiplier.to_be_bytes());
        hasher.update(config.settings.call_timeout_secs.to_be_bytes());

        // Shared dirs (sorted for determinism)
        let mut dirs: Vec<_> = config.settings.shared_dirs.iter().collect();
        dirs.sort_unstable();
        for dir in dirs {
            hasher.update(dir.as_bytes());
        }
        hasher.update(config.settings.artifact_dir.as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single environment entry.
    #[must_use]
    pub fn hash_environment(&self, name: &str, spec: &EnvironmentSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(name.as_bytes());
        hasher.update(spec.project_ref.as_bytes());
        if let Some(region) = &spec.region {
            hasher.update(region.as_bytes());
        }
        hasher.update(spec.pooled_port.to_be_bytes());
        hasher.update(spec.direct_port.to_be_bytes());
        hasher.update(if spec.protected { [1u8] } else { [0u8] });

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Use constant-time comparison to avoid timing attacks
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_spec(project_ref: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            project_ref: project_ref.to_string(),
            region: None,
            pooled_port: 6543,
            direct_port: 5432,
            protected: false,
        }
    }

    #[test]
    fn test_environment_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let spec = create_test_spec("abcdefghijklmnopqrst");

        let hash1 = hasher.hash_environment("prod", &spec);
        let hash2 = hasher.hash_environment("prod", &spec);

        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_different_environments_different_hash() {
        let hasher = ConfigHasher::new();
        let spec1 = create_test_spec("abcdefghijklmnopqrst");
        let spec2 = create_test_spec("tsrqponmlkjihgfedcba");

        let hash1 = hasher.hash_environment("prod", &spec1);
        let hash2 = hasher.hash_environment("prod", &spec2);

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_protection_flag_changes_hash() {
        let hasher = ConfigHasher::new();
        let open = create_test_spec("abcdefghijklmnopqrst");
        let mut protected = open.clone();
        protected.protected = true;

        assert_ne!(
            hasher.hash_environment("prod", &open),
            hasher.hash_environment("prod", &protected)
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
