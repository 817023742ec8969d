//! wikisync command-line tool.
//!
//! Provides subcommands for running a sync cycle, inspecting local status
//! and pending conflicts, and generating / validating configuration files.

mod style;
mod summary;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wikisync_core::config::SyncConfig;
use wikisync_core::errors::SyncError;
use wikisync_core::local::LocalTree;
use wikisync_core::models::{SyncMode, SyncOptions};
use wikisync_core::state::JsonStateFile;
use wikisync_core::sync_engine::{self, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// wikisync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "wikisync",
    version,
    about = "Keep a wiki page tree and a directory of text files in sync"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: <config dir>/wikisync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync cycle.
    Sync {
        /// Report what would happen without changing anything.
        #[arg(long)]
        dry_run: bool,

        /// Overwrite the remote with the local files.
        #[arg(long)]
        force_push: bool,

        /// Overwrite the local files with the remote pages.
        #[arg(long)]
        force_pull: bool,

        /// With --dry-run, print a diff for every planned content change.
        #[arg(long)]
        diff: bool,

        /// Print the report as JSON instead of tables.
        #[arg(long)]
        json: bool,
    },

    /// Show local edits, new and missing files. Makes no remote calls.
    Status,

    /// List pages with unresolved conflict markers.
    Conflicts,

    /// Generate a default configuration file.
    Init {
        /// Output path [default: the --config path].
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init { output, force } => {
            init_logging(cli.verbose, None);
            cmd_init(output.as_deref().unwrap_or(&config_path), force)
        }
        Commands::Validate => {
            init_logging(cli.verbose, None);
            cmd_validate(&config_path)
        }
        Commands::Sync {
            dry_run,
            force_push,
            force_pull,
            diff,
            json,
        } => {
            // Checked before the config is even read: no remote call may happen.
            let mode = SyncMode::from_flags(force_push, force_pull)?;
            let config = load_config(&config_path, cli.verbose)?;
            cmd_sync(config, SyncOptions { mode, dry_run }, diff, json).await
        }
        Commands::Status => {
            let config = load_config(&config_path, cli.verbose)?;
            cmd_status(&config)
        }
        Commands::Conflicts => {
            let config = load_config(&config_path, cli.verbose)?;
            cmd_conflicts(&config)
        }
    }
}

/// Exit code for an error: the run-level taxonomy when there is one.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SyncError>())
        .map(SyncError::exit_code)
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Config and logging helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("no configuration directory on this platform")?;
    Ok(dir.join("wikisync").join("config.toml"))
}

/// `RUST_LOG` wins; otherwise `-v` flags, then the configured level, then warn.
fn init_logging(verbose: u8, configured: Option<&str>) {
    let level = match verbose {
        0 => configured.unwrap_or("warn"),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path, verbose: u8) -> Result<SyncConfig> {
    let mut config = SyncConfig::load_from_file(path)
        .with_context(|| format!("failed to load configuration file {}", path.display()))?;
    init_logging(verbose, Some(config.logging.level.as_str()));
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_sync(config: SyncConfig, options: SyncOptions, diff: bool, json: bool) -> Result<u8> {
    let engine = SyncEngine::from_config(config)?;
    let report = engine.run(options).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        summary::print_report(&report, diff);
    }
    Ok(report.exit_status().code())
}

fn cmd_status(config: &SyncConfig) -> Result<u8> {
    let tree = LocalTree::from_config(&config.local);
    let backend = JsonStateFile::new(config.state_path());
    let status = sync_engine::local_status(&tree, &backend)?;

    println!();
    println!("{}", style::header("wikisync status"));
    println!();
    println!("  Local root   : {}", config.local.root.display());
    println!("  Root page    : {}", config.remote.root_page_id);
    println!("  Tracked pages: {}", status.tracked);
    println!(
        "  Last synced  : {}",
        status
            .last_synced
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!();

    let changes =
        status.modified.len() + status.new_files.len() + status.missing.len() + status.conflicts.len();
    if changes == 0 {
        println!("{}", style::success("No local changes"));
    } else {
        println!("{}", summary::status_table(&status));
    }
    println!();
    Ok(if status.conflicts.is_empty() { 0 } else { 2 })
}

fn cmd_conflicts(config: &SyncConfig) -> Result<u8> {
    let backend = JsonStateFile::new(config.state_path());
    let pending = sync_engine::pending_conflicts(&backend)?;

    if pending.is_empty() {
        println!();
        println!("{}", style::success("No unresolved conflicts"));
        println!();
        return Ok(0);
    }

    println!();
    println!(
        "{}",
        style::header(&format!("Unresolved conflicts ({})", pending.len()))
    );
    println!();
    println!("{}", summary::conflicts_table(&pending));
    println!();
    println!(
        "{}",
        style::dim("Edit each file to remove the conflict markers, then run `wikisync sync`.")
    );
    Ok(2)
}

fn cmd_init(output: &Path, force: bool) -> Result<u8> {
    if output.exists() && !force {
        anyhow::bail!(
            "file already exists: {}. Use --force or a different --output path.",
            output.display()
        );
    }
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(output, SyncConfig::default_template()).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the [remote] and [local] sections");
    println!("  2. Export the API token in the variable named by token_env (WIKISYNC_TOKEN)");
    println!(
        "  3. Validate with: wikisync validate --config {}",
        output.display()
    );
    println!(
        "  4. Preview the first sync: wikisync sync --dry-run --config {}",
        output.display()
    );
    Ok(0)
}

fn cmd_validate(config_path: &Path) -> Result<u8> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        SyncConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        return Err(SyncError::from(e)).context("configuration validation failed");
    }
    println!("  [OK] All required fields are valid");

    println!();
    println!("Configuration summary:");
    println!("  Wiki URL      : {}", config.remote.base_url);
    println!("  Space         : {}", config.remote.space_key);
    println!("  Root page     : {}", config.remote.root_page_id);
    println!("  User          : {}", config.remote.username);
    println!(
        "  Token         : {} (${})",
        if config.remote.token.is_some() {
            "set"
        } else {
            "NOT SET"
        },
        config.remote.token_env
    );
    println!("  Local root    : {}", config.local.root.display());
    println!("  Extension     : .{}", config.local.extension);
    println!("  State file    : {}", config.state_path().display());
    println!("  Workers       : {}", config.sync.workers);
    println!();
    println!("Configuration is valid.");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_force_flags_are_rejected_with_exit_code_one() {
        let cli = Cli::try_parse_from(["wikisync", "sync", "--force-push", "--force-pull"]).unwrap();
        let Commands::Sync {
            force_push,
            force_pull,
            ..
        } = cli.command
        else {
            panic!("expected the sync command");
        };
        let err = anyhow::Error::from(SyncMode::from_flags(force_push, force_pull).unwrap_err());
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn test_exit_code_follows_sync_error() {
        let err = anyhow::Error::from(SyncError::Auth("bad token".into())).context("sync failed");
        assert_eq!(exit_code(&err), 3);
        let err = anyhow::Error::from(SyncError::Network("timeout".into()));
        assert_eq!(exit_code(&err), 4);
    }

    #[test]
    fn test_init_writes_a_valid_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        assert_eq!(cmd_init(&path, false).unwrap(), 0);
        assert!(cmd_init(&path, false).is_err());
        assert_eq!(cmd_init(&path, true).unwrap(), 0);

        let config = SyncConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_verbose_flag_counts() {
        let cli = Cli::try_parse_from(["wikisync", "-vv", "status"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.config.is_none());
    }
}
