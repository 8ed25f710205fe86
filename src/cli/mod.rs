//! CLI module for the envsync tool.
//!
//! This module provides the command-line interface for comparing and
//! synchronizing environments.

mod commands;
mod output;

pub use commands::{Cli, Commands, KindArg, ModeArg, OutputFormat};
pub use output::OutputFormatter;
