//! Configuration module for the envsync engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `envsync.sync.yaml`
//! - Resolving credentials into immutable environments
//! - Validation of configuration values
//! - Computing configuration hashes for run correlation

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    Credentials, Environment, EnvironmentSpec, RetrySpec, SettingsSpec, SyncConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
