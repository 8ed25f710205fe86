//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::planner::{ResourceKind, SyncMode};

/// Envsync - environment synchronization for hosted backend projects.
#[derive(Parser, Debug)]
#[command(name = "envsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "ENVSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new envsync project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the sync configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compare two environments without changing anything.
    Diff {
        /// Source environment name.
        #[arg(short, long)]
        source: String,

        /// Target environment name.
        #[arg(short, long)]
        target: String,

        /// Resource kinds to compare (defaults to all).
        #[arg(short, long, value_delimiter = ',')]
        kinds: Vec<KindArg>,

        /// Restrict to the named resources (tables as schema.table).
        #[arg(short, long, value_delimiter = ',')]
        filter: Vec<String>,

        /// Compare objects inside buckets, not just bucket definitions.
        #[arg(long)]
        include_files: bool,

        /// Download and compare function bundles byte by byte.
        #[arg(long)]
        full_compare: bool,
    },

    /// Copy state from a source environment to a target environment.
    Sync {
        /// Source environment name.
        #[arg(short, long)]
        source: String,

        /// Target environment name.
        #[arg(short, long)]
        target: String,

        /// How the target is treated (incremental, replace).
        #[arg(short, long, default_value = "incremental")]
        mode: ModeArg,

        /// Resource kinds to sync (defaults to all).
        #[arg(short, long, value_delimiter = ',')]
        kinds: Vec<KindArg>,

        /// Restrict to the named resources (tables as schema.table).
        #[arg(short, long, value_delimiter = ',')]
        filter: Vec<String>,

        /// Copy objects inside buckets, not just bucket definitions.
        #[arg(long)]
        include_files: bool,

        /// Download and compare function bundles byte by byte.
        #[arg(long)]
        full_compare: bool,

        /// Skip the pre-destructive backup of protected targets.
        #[arg(long)]
        skip_backup: bool,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show recent sync runs.
    Runs {
        /// Number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

/// Resource kind argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KindArg {
    /// Database tables and rows.
    Tables,
    /// Storage buckets and objects.
    Storage,
    /// Serverless functions.
    Functions,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Tables => Self::Tables,
            KindArg::Storage => Self::Storage,
            KindArg::Functions => Self::Functions,
        }
    }
}

/// Sync mode argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ModeArg {
    /// Copy what the target is missing; never delete anything.
    #[default]
    Incremental,
    /// Make the target an exact mirror of the source.
    Replace,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Incremental => Self::Incremental,
            ModeArg::Replace => Self::Replace,
        }
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_defaults_to_incremental() {
        let cli = Cli::parse_from([
            "envsync", "sync", "--source", "dev", "--target", "staging",
        ]);
        match cli.command {
            Commands::Sync { mode, kinds, include_files, yes, .. } => {
                assert_eq!(mode, ModeArg::Incremental);
                assert!(kinds.is_empty());
                assert!(!include_files);
                assert!(!yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_kind_list_parses_comma_separated() {
        let cli = Cli::parse_from([
            "envsync", "diff", "--source", "dev", "--target", "prod",
            "--kinds", "tables,functions",
        ]);
        match cli.command {
            Commands::Diff { kinds, .. } => {
                assert_eq!(kinds, vec![KindArg::Tables, KindArg::Functions]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_replace_mode_parses() {
        let cli = Cli::parse_from([
            "envsync", "sync", "--source", "dev", "--target", "staging",
            "--mode", "replace", "--include-files", "--yes",
        ]);
        match cli.command {
            Commands::Sync { mode, include_files, yes, .. } => {
                assert_eq!(mode, ModeArg::Replace);
                assert!(include_files);
                assert!(yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
