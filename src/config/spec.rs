//! Configuration specification types for the sync engine.
//!
//! This module defines the structs that map to the `envsync.sync.yaml` file,
//! plus the resolved [`Environment`] value built from a spec entry and the
//! credentials found in the process environment. Resolved environments are
//! immutable for the whole run; no component reads ambient process state
//! after startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// The root configuration structure for a sync project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct SyncConfig {
    /// Config file format version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Unique name for the project.
    #[validate(length(min = 1))]
    pub project: String,
    /// Named environments, keyed by identifier (e.g. "prod", "test").
    pub environments: BTreeMap<String, EnvironmentSpec>,
    /// Optional engine settings.
    #[serde(default)]
    pub settings: SettingsSpec,
}

/// Declarative description of one environment.
///
/// Credentials never appear here; they are resolved from environment
/// variables at startup (see the parser).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct EnvironmentSpec {
    /// Remote project identifier (the platform's project ref).
    #[validate(length(min = 1))]
    pub project_ref: String,
    /// Region hint enabling shared pooled endpoints (e.g. "eu-west-1").
    #[serde(default)]
    pub region: Option<String>,
    /// Port served by the connection pooler.
    #[serde(default = "default_pooled_port")]
    #[validate(range(min = 1))]
    pub pooled_port: u16,
    /// Port served by the dedicated database host.
    #[serde(default = "default_direct_port")]
    #[validate(range(min = 1))]
    pub direct_port: u16,
    /// Protected environments take a backup before any destructive action.
    #[serde(default)]
    pub protected: bool,
}

/// Engine-wide settings with sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingsSpec {
    /// Retry policy applied to rate-limited remote calls.
    #[serde(default)]
    pub retry: RetrySpec,
    /// Per-remote-call timeout in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Local directories searched for shared function files.
    #[serde(default = "default_shared_dirs")]
    pub shared_dirs: Vec<String>,
    /// Directory holding run records, backups, and locks.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySpec {
    /// Maximum executions of one operation, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each further attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// A fully resolved environment: spec entry plus credentials.
///
/// Built once at process start and passed by reference into every
/// component.
#[derive(Clone)]
pub struct Environment {
    /// Environment identifier from the config file.
    pub name: String,
    /// Remote project identifier.
    pub project_ref: String,
    /// Region hint, when configured.
    pub region: Option<String>,
    /// Pooler port.
    pub pooled_port: u16,
    /// Dedicated host port.
    pub direct_port: u16,
    /// Whether destructive actions require a prior backup.
    pub protected: bool,
    /// Credential set for this environment.
    pub credentials: Credentials,
}

/// Credential set for one environment.
#[derive(Clone)]
pub struct Credentials {
    /// Database password for the postgres principal.
    pub db_password: String,
    /// Service-role key for the storage API.
    pub service_key: String,
    /// Personal access token for the management API.
    pub access_token: String,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("project_ref", &self.project_ref)
            .field("region", &self.region)
            .field("pooled_port", &self.pooled_port)
            .field("direct_port", &self.direct_port)
            .field("protected", &self.protected)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Default for SettingsSpec {
    fn default() -> Self {
        Self {
            retry: RetrySpec::default(),
            call_timeout_secs: default_call_timeout(),
            shared_dirs: default_shared_dirs(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// Default value functions

fn default_version() -> String {
    String::from("1")
}

const fn default_pooled_port() -> u16 {
    6543
}

const fn default_direct_port() -> u16 {
    5432
}

const fn default_call_timeout() -> u64 {
    120
}

fn default_shared_dirs() -> Vec<String> {
    vec![String::from("supabase/functions/_shared")]
}

fn default_artifact_dir() -> String {
    String::from(".envsync")
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    2000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

impl SyncConfig {
    /// Returns the configured environment names in stable order.
    #[must_use]
    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }
}

impl Environment {
    /// Builds a resolved environment from its spec entry and credentials.
    #[must_use]
    pub fn from_spec(name: &str, spec: &EnvironmentSpec, credentials: Credentials) -> Self {
        Self {
            name: name.to_string(),
            project_ref: spec.project_ref.clone(),
            region: spec.region.clone(),
            pooled_port: spec.pooled_port,
            direct_port: spec.direct_port,
            protected: spec.protected,
            credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
project: demo
environments:
  prod:
    project_ref: abcdefghijklmnopqrst
    protected: true
  test:
    project_ref: tsrqponmlkjihgfedcba
    region: eu-west-1
";

    #[test]
    fn test_minimal_config_defaults() {
        let config: SyncConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.version, "1");
        assert_eq!(config.environment_names(), vec!["prod", "test"]);

        let prod = &config.environments["prod"];
        assert_eq!(prod.pooled_port, 6543);
        assert_eq!(prod.direct_port, 5432);
        assert!(prod.protected);
        assert!(prod.region.is_none());

        assert_eq!(config.settings.retry.max_attempts, 3);
        assert_eq!(config.settings.retry.initial_delay_ms, 2000);
        assert_eq!(config.settings.call_timeout_secs, 120);
        assert_eq!(config.settings.artifact_dir, ".envsync");
    }

    #[test]
    fn test_settings_override() {
        let yaml = r"
project: demo
environments:
  prod:
    project_ref: abcdefghijklmnopqrst
settings:
  retry:
    max_attempts: 5
    initial_delay_ms: 500
  call_timeout_secs: 30
  artifact_dir: /var/lib/envsync
";
        let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.settings.retry.max_attempts, 5);
        assert_eq!(config.settings.retry.initial_delay_ms, 500);
        assert!((config.settings.retry.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.settings.call_timeout_secs, 30);
        assert_eq!(config.settings.artifact_dir, "/var/lib/envsync");
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials {
            db_password: String::from("hunter2"),
            service_key: String::from("sk-secret"),
            access_token: String::from("sbp-secret"),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret"));
    }
}
