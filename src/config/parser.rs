//! Configuration parser for loading and resolving configuration.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence, plus the one-time resolution of
//! credentials into immutable [`Environment`] values. After resolution no
//! component consults the process environment again.

use crate::error::{ConfigError, Result, SyncError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::{Credentials, Environment, SyncConfig};

/// Configuration parser for loading sync configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<SyncConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(SyncError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<SyncConfig> {
        debug!("Parsing YAML configuration");

        let config: SyncConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            SyncError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Successfully parsed configuration for project: {}",
            config.project
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `ENVSYNC_<SECTION>_<KEY>` (e.g., `ENVSYNC_ARTIFACT_DIR`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<SyncConfig> {
        let mut config = self.load_file(path)?;

        // Apply environment overrides
        Self::apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut SyncConfig) {
        if let Ok(project) = std::env::var("ENVSYNC_PROJECT") {
            debug!("Overriding project from environment");
            config.project = project;
        }

        if let Ok(dir) = std::env::var("ENVSYNC_ARTIFACT_DIR") {
            debug!("Overriding settings.artifact_dir from environment");
            config.settings.artifact_dir = dir;
        }

        if let Ok(timeout) = std::env::var("ENVSYNC_CALL_TIMEOUT_SECS")
            && let Ok(secs) = timeout.parse::<u64>()
        {
            debug!("Overriding settings.call_timeout_secs from environment");
            config.settings.call_timeout_secs = secs;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                SyncError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Resolves one configured environment into an immutable value,
    /// pulling its credentials from process environment variables.
    ///
    /// Per-environment variables are named `ENVSYNC_<NAME>_DB_PASSWORD` and
    /// `ENVSYNC_<NAME>_SERVICE_KEY`; the management API token is shared
    /// across environments as `ENVSYNC_ACCESS_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is not configured or a required
    /// credential variable is missing.
    pub fn resolve_environment(config: &SyncConfig, name: &str) -> Result<Environment> {
        Self::resolve_environment_from(config, name, &|var| std::env::var(var).ok())
    }

    /// Credential-lookup-injected variant of [`Self::resolve_environment`],
    /// shared with tests.
    fn resolve_environment_from(
        config: &SyncConfig,
        name: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Environment> {
        let spec = config.environments.get(name).ok_or_else(|| {
            SyncError::Config(ConfigError::UnknownEnvironment {
                name: name.to_string(),
            })
        })?;

        let require = |var: String| -> Result<String> {
            lookup(&var).ok_or_else(|| {
                SyncError::Config(ConfigError::MissingEnvVar { name: var.clone() })
            })
        };

        let credentials = Credentials {
            db_password: require(credential_var(name, "DB_PASSWORD"))?,
            service_key: require(credential_var(name, "SERVICE_KEY"))?,
            access_token: require(String::from("ENVSYNC_ACCESS_TOKEN"))?,
        };

        Ok(Environment::from_spec(name, spec, credentials))
    }
}

/// Builds the per-environment credential variable name.
fn credential_var(environment: &str, suffix: &str) -> String {
    let upper = environment.to_uppercase().replace('-', "_");
    format!("ENVSYNC_{upper}_{suffix}")
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "envsync.sync.yaml",
    "envsync.sync.yml",
    "sync.yaml",
    "sync.yml",
];

/// Finds the configuration file in the current directory, parent
/// directories, or the user's `~/.envsync` directory.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = home.join(".envsync").join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }
    }

    Err(SyncError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
