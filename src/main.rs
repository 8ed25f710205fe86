//! Envsync CLI entrypoint.
//!
//! This is the main entrypoint for the envsync command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use envsync::audit::{ArtifactStore, LocalArtifactStore};
use envsync::cli::{Cli, Commands, KindArg, OutputFormatter};
use envsync::config::{find_config_file, ConfigParser, ConfigValidator, SyncConfig};
use envsync::engine::{EnvironmentHandle, SyncEngine, SyncRequest};
use envsync::error::{Result, SyncError};
use envsync::fingerprint::DiffResult;
use envsync::planner::{ResourceKind, SyncMode};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("ENVSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings),
        Commands::Diff {
            source,
            target,
            kinds,
            filter,
            include_files,
            full_compare,
        } => {
            cmd_diff(
                cli.config.as_ref(),
                &source,
                &target,
                &kinds,
                filter,
                include_files,
                full_compare,
                &formatter,
            )
            .await
        }
        Commands::Sync {
            source,
            target,
            mode,
            kinds,
            filter,
            include_files,
            full_compare,
            skip_backup,
            yes,
        } => {
            cmd_sync(
                cli.config.as_ref(),
                &source,
                &target,
                mode.into(),
                &kinds,
                filter,
                include_files,
                full_compare,
                skip_backup,
                yes,
                &formatter,
            )
            .await
        }
        Commands::Runs { limit } => cmd_runs(cli.config.as_ref(), limit, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &PathBuf, force: bool) -> Result<()> {
    info!("Initializing new envsync project in: {}", path.display());

    let config_path = path.join("envsync.sync.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    // Create directory if needed
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    // Write config template
    let config_template = include_str!("../templates/envsync.sync.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    // Write .env.example
    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    // Write/update .gitignore
    let gitignore_content = ".env\n.envsync/\n";
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".envsync") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Envsync")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".envsync") {
                writeln!(file, ".envsync/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, gitignore_content)?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your credentials");
    eprintln!("  2. Edit envsync.sync.yaml with your environments");
    eprintln!("  3. Run 'envsync validate' to check your configuration");
    eprintln!("  4. Run 'envsync diff --source dev --target staging' to compare");
    eprintln!("  5. Run 'envsync sync --source dev --target staging' to copy");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    // Load .env
    let parser = parser_for(&config_file);
    parser.load_dotenv()?;

    // Parse config
    let config = parser.load_file(&config_file)?;

    // Validate
    let validator = ConfigValidator::new();
    let result = validator.validate(&config)?;

    if result.is_valid() {
        eprintln!("Configuration is valid!");
        if show_warnings && !result.warnings.is_empty() {
            eprintln!("\nWarnings:");
            for warning in &result.warnings {
                eprintln!("  - {warning}");
            }
        }
    }

    // Show summary
    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.project);
    eprintln!("  Environments: {}", config.environments.len());
    for (name, spec) in &config.environments {
        let protection = if spec.protected { " [protected]" } else { "" };
        eprintln!("    {name}: {}{protection}", spec.project_ref);
    }
    eprintln!("  Artifact dir: {}", config.settings.artifact_dir);

    Ok(())
}

/// Compare two environments.
#[allow(clippy::too_many_arguments)]
async fn cmd_diff(
    config_path: Option<&PathBuf>,
    source: &str,
    target: &str,
    kinds: &[KindArg],
    filter: Vec<String>,
    include_files: bool,
    full_compare: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, base_dir) = load_project(config_path)?;
    let (source_handle, target_handle) = connect_pair(&config, source, target)?;
    let artifacts = artifact_store(&config, &base_dir);

    let engine = SyncEngine::new(&source_handle, &target_handle, &artifacts, &config.settings)
        .with_full_compare(full_compare);

    let filter = non_empty(filter);
    let filter_ref = filter.as_deref();

    let mut diffs: Vec<(ResourceKind, DiffResult)> = Vec::new();
    for kind in resolve_kinds(kinds) {
        let diff = match kind {
            ResourceKind::Tables => engine.diff_tables(filter_ref).await?,
            ResourceKind::Storage => engine.diff_storage(filter_ref, include_files).await?,
            ResourceKind::Functions => engine.diff_functions(filter_ref).await?,
        };
        diffs.push((kind, diff));
    }

    let output = formatter.format_diffs(&diffs);
    eprintln!("{output}");

    Ok(())
}

/// Run a sync.
#[allow(clippy::too_many_arguments)]
async fn cmd_sync(
    config_path: Option<&PathBuf>,
    source: &str,
    target: &str,
    mode: SyncMode,
    kinds: &[KindArg],
    filter: Vec<String>,
    include_files: bool,
    full_compare: bool,
    skip_backup: bool,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, base_dir) = load_project(config_path)?;
    let (source_handle, target_handle) = connect_pair(&config, source, target)?;
    let artifacts = artifact_store(&config, &base_dir);

    let kind_list = resolve_kinds(kinds);
    let kind_names: Vec<String> = kind_list.iter().map(ToString::to_string).collect();
    eprintln!(
        "Sync {source} -> {target} ({mode} mode, kinds: {})",
        kind_names.join(", ")
    );

    // Confirm
    if !auto_approve {
        if mode == SyncMode::Replace {
            eprintln!("Replace mode deletes resources that exist only in '{target}'.");
            eprint!("This action is IRREVERSIBLE. Type 'replace' to confirm: ");
            std::io::stderr().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if input.trim() != "replace" {
                eprintln!("Sync cancelled.");
                return Ok(());
            }
        } else {
            eprint!("Do you want to continue? [y/N]: ");
            std::io::stderr().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                eprintln!("Sync cancelled.");
                return Ok(());
            }
        }
    }

    // An interrupt stops the run; the process keeps running so the lock
    // and run record are left clean. An action caught mid-flight is
    // recorded as failed, never as succeeded.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current resource");
            let _ = cancel_tx.send(true);
        }
    });

    let engine = SyncEngine::new(&source_handle, &target_handle, &artifacts, &config.settings)
        .with_destructive_allowed(mode == SyncMode::Replace)
        .with_skip_backup(skip_backup)
        .with_full_compare(full_compare)
        .with_cancellation(cancel_rx);

    let mut request = SyncRequest::all(mode)
        .with_kinds(kind_list)
        .with_include_files(include_files);
    if let Some(filter) = non_empty(filter) {
        request = request.with_filter(filter);
    }

    let record = engine.run(&request).await?;

    let output = formatter.format_record(&record);
    eprintln!("{output}");

    if record.is_success() {
        Ok(())
    } else {
        Err(SyncError::internal(format!(
            "{} resource(s) failed to sync",
            record.total_failed()
        )))
    }
}

/// Show recent runs.
async fn cmd_runs(
    config_path: Option<&PathBuf>,
    limit: usize,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, base_dir) = load_project(config_path)?;
    let artifacts = artifact_store(&config, &base_dir);

    let runs = artifacts.list_runs(limit).await?;
    if runs.is_empty() {
        eprintln!("No runs recorded yet.");
        return Ok(());
    }

    let output = formatter.format_runs(&runs);
    eprintln!("{output}");

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Builds a parser rooted at the config file's directory.
fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")))
}

/// Loads and validates the configuration, returning it with its base
/// directory.
fn load_project(config_path: Option<&PathBuf>) -> Result<(SyncConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;

    // Validate
    let validator = ConfigValidator::new();
    validator.validate(&config)?;

    Ok((config, base_dir))
}

/// Resolves credentials and connects both ends of a sync.
fn connect_pair(
    config: &SyncConfig,
    source: &str,
    target: &str,
) -> Result<(EnvironmentHandle, EnvironmentHandle)> {
    let source_env = ConfigParser::resolve_environment(config, source)?;
    let target_env = ConfigParser::resolve_environment(config, target)?;
    let source_handle = EnvironmentHandle::connect(&source_env)?;
    let target_handle = EnvironmentHandle::connect(&target_env)?;
    Ok((source_handle, target_handle))
}

/// Creates the artifact store rooted next to the config file.
fn artifact_store(config: &SyncConfig, base_dir: &Path) -> LocalArtifactStore {
    LocalArtifactStore::with_base_dir(base_dir.join(&config.settings.artifact_dir))
}

/// Expands an empty kind selection to all kinds.
fn resolve_kinds(kinds: &[KindArg]) -> Vec<ResourceKind> {
    if kinds.is_empty() {
        vec![
            ResourceKind::Tables,
            ResourceKind::Storage,
            ResourceKind::Functions,
        ]
    } else {
        kinds.iter().map(|kind| ResourceKind::from(*kind)).collect()
    }
}

/// Treats an empty list as no filter.
fn non_empty(filter: Vec<String>) -> Option<Vec<String>> {
    if filter.is_empty() {
        None
    } else {
        Some(filter)
    }
}
