//! Configuration validation for sync configs.
//!
//! This module provides comprehensive validation of sync configurations,
//! ensuring all values are valid and consistent before any remote call is
//! made.

use crate::error::{ConfigError, Result, SyncError};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{EnvironmentSpec, SettingsSpec, SyncConfig};

/// Validator for sync configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Known platform regions with shared pooler hosts.
    known_regions: HashSet<String>,
}

/// Regions with a shared pooler deployment.
const KNOWN_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-central-2",
    "eu-north-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "sa-east-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

/// Environment names that usually point at production data.
const PRODUCTION_NAMES: &[&str] = &["prod", "production", "live", "main"];

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator with the default known regions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            known_regions: KNOWN_REGIONS.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Adds a custom region to the known list.
    pub fn add_region(&mut self, region: impl Into<String>) {
        self.known_regions.insert(region.into());
    }

    /// Validates a sync configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &SyncConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        self.validate_environments(config, &mut result);
        Self::validate_settings(&config.settings, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(SyncError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates project-level fields.
    fn validate_project(config: &SyncConfig, result: &mut ValidationResult) {
        merge_derive_errors("", &Validate::validate(config), result);

        if config.project.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&config.project) {
            result.errors.push(ValidationError {
                field: String::from("project"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.project
                ),
            });
        }
    }

    /// Validates all environment entries.
    fn validate_environments(&self, config: &SyncConfig, result: &mut ValidationResult) {
        if config.environments.len() < 2 {
            result
                .warnings
                .push(String::from("Fewer than two environments defined; nothing to sync between"));
        }

        let mut seen_refs: HashSet<&str> = HashSet::new();

        for (name, spec) in &config.environments {
            let prefix = format!("environments.{name}");

            merge_derive_errors(&prefix, &Validate::validate(spec), result);

            // Validate environment name format
            if !is_valid_name(name) {
                result.errors.push(ValidationError {
                    field: prefix.clone(),
                    message: format!(
                        "Environment name '{name}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    ),
                });
            }

            // Validate project ref format
            if !is_valid_project_ref(&spec.project_ref) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.project_ref"),
                    message: format!(
                        "Project ref '{}' is invalid. Expected 16-24 lowercase alphanumeric characters.",
                        spec.project_ref
                    ),
                });
            }

            // The same remote project behind two names makes an env sync
            // silently self-referential
            if seen_refs.contains(spec.project_ref.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.project_ref"),
                    message: format!("Duplicate project ref: {}", spec.project_ref),
                });
            } else {
                seen_refs.insert(spec.project_ref.as_str());
            }

            self.validate_endpoints(name, spec, &prefix, result);

            if PRODUCTION_NAMES.contains(&name.as_str()) && !spec.protected {
                result.warnings.push(format!(
                    "{prefix}: environment looks like production but is not marked protected; \
                     destructive syncs will run without a backup"
                ));
            }
        }
    }

    /// Validates endpoint-related fields of one environment.
    fn validate_endpoints(
        &self,
        name: &str,
        spec: &EnvironmentSpec,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        if spec.pooled_port == spec.direct_port {
            result.errors.push(ValidationError {
                field: format!("{prefix}.pooled_port"),
                message: format!(
                    "Environment '{name}' uses the same port ({}) for pooled and direct connections",
                    spec.pooled_port
                ),
            });
        }

        if let Some(region) = &spec.region
            && !self.known_regions.contains(region)
        {
            result.warnings.push(format!(
                "{prefix}.region: Unknown region '{region}'. Pooled endpoints may be unreachable.",
            ));
        }
    }

    /// Validates engine settings.
    fn validate_settings(settings: &SettingsSpec, result: &mut ValidationResult) {
        if settings.retry.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("settings.retry.max_attempts"),
                message: String::from("Retry attempts must be at least 1"),
            });
        }

        if settings.retry.backoff_multiplier < 1.0 {
            result.warnings.push(String::from(
                "settings.retry.backoff_multiplier: multiplier below 1.0 shrinks delays between retries",
            ));
        }

        if settings.call_timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("settings.call_timeout_secs"),
                message: String::from("Per-call timeout must be at least 1 second"),
            });
        }

        let mut seen_dirs = HashSet::new();
        for (i, dir) in settings.shared_dirs.iter().enumerate() {
            if !seen_dirs.insert(dir.as_str()) {
                result
                    .warnings
                    .push(format!("settings.shared_dirs[{i}]: Duplicate shared dir: {dir}"));
            }
        }
    }
}

/// Folds field errors from the derive-level check into the result.
fn merge_derive_errors(
    prefix: &str,
    outcome: &std::result::Result<(), validator::ValidationErrors>,
    result: &mut ValidationResult,
) {
    let Err(errors) = outcome else { return };

    for (field, field_errors) in errors.field_errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        for error in field_errors.iter() {
            let message = error
                .message
                .as_ref()
                .map_or_else(|| format!("failed {} check", error.code), ToString::to_string);
            result.errors.push(ValidationError {
                field: path.clone(),
                message,
            });
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    // Cannot end with hyphen
    if name.ends_with('-') {
        return false;
    }

    // Cannot have consecutive hyphens
    if name.contains("--") {
        return false;
    }

    true
}

/// Validates the platform project-ref format.
fn is_valid_project_ref(project_ref: &str) -> bool {
    (16..=24).contains(&project_ref.len())
        && project_ref
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> SyncConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("prod"));
        assert!(is_valid_name("stage-eu-2"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("test"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Prod")); // uppercase
        assert!(!is_valid_name("2nd-stage")); // starts with number
        assert!(!is_valid_name("stage_eu")); // underscore
        assert!(!is_valid_name("stage-")); // ends with hyphen
        assert!(!is_valid_name("stage--eu")); // consecutive hyphens
    }

    #[test]
    fn test_valid_project_ref() {
        assert!(is_valid_project_ref("abcdefghijklmnopqrst"));
        assert!(is_valid_project_ref("abc123def456ghi7"));
        assert!(!is_valid_project_ref("short"));
        assert!(!is_valid_project_ref("ABCDEFGHIJKLMNOPQRST"));
        assert!(!is_valid_project_ref("abcdefgh-jklmnopqrst"));
    }

    #[test]
    fn test_duplicate_project_ref_rejected() {
        let config = parse(
            r"
project: demo
environments:
  prod:
    project_ref: abcdefghijklmnopqrst
  test:
    project_ref: abcdefghijklmnopqrst
",
        );
        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_same_pooled_and_direct_port_rejected() {
        let config = parse(
            r"
project: demo
environments:
  dev:
    project_ref: abcdefghijklmnopqrst
    pooled_port: 5432
    direct_port: 5432
  test:
    project_ref: tsrqponmlkjihgfedcba
",
        );
        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_unknown_region_warns() {
        let config = parse(
            r"
project: demo
environments:
  dev:
    project_ref: abcdefghijklmnopqrst
    region: moon-base-1
  test:
    project_ref: tsrqponmlkjihgfedcba
",
        );
        let validator = ConfigValidator::new();
        let result = validator.validate(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("moon-base-1")));
    }

    #[test]
    fn test_unprotected_production_warns() {
        let config = parse(
            r"
project: demo
environments:
  prod:
    project_ref: abcdefghijklmnopqrst
  test:
    project_ref: tsrqponmlkjihgfedcba
",
        );
        let validator = ConfigValidator::new();
        let result = validator.validate(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("protected")));
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let config = parse(
            r"
project: demo
environments:
  dev:
    project_ref: abcdefghijklmnopqrst
  test:
    project_ref: tsrqponmlkjihgfedcba
settings:
  retry:
    max_attempts: 0
",
        );
        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }
}
