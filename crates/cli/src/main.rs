//! shadowdiff command-line tool.
//!
//! Checks whether the remote org's copy of a project's metadata has
//! diverged from the local package directory before a push, and provides
//! helpers for generating and validating the configuration file.

mod check;
mod signals;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shadowdiff_core::config::AppConfig;

use check::{CheckArgs, CheckOutcome};

/// File name looked up in the working directory when `--config` is absent.
const LOCAL_CONFIG_FILE: &str = "shadowdiff.toml";

/// Exit code for any failed run.
const EXIT_ERROR: u8 = 2;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// shadowdiff command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "shadowdiff",
    version,
    about = "Detect remote metadata changes that a push would overwrite"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. "info", "shadowdiff_core=debug"). Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare the local package directory against the remote org.
    Check {
        /// Project root directory.
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Username or alias of the remote org.
        #[arg(short = 'u', long)]
        target_username: Option<String>,

        /// Package directory, relative to the project root.
        #[arg(long)]
        package_dir: Option<PathBuf>,

        /// Manifest file, relative to the project root.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./shadowdiff.toml")]
        output: PathBuf,
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
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref(), None);
            cmd_init(&output).map(|()| 0)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref(), None);
            cmd_validate(cli.config.as_deref()).map(|()| 0)
        }
        Commands::Check {
            project,
            target_username,
            package_dir,
            manifest,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(cli.log_level.as_deref(), Some(&config));
            let args = CheckArgs {
                project,
                target_username,
                package_dir,
                manifest,
                json,
            };
            let outcome: CheckOutcome = check::run_check(&config, args).await?;
            Ok(outcome.exit_code())
        }
    }
}

/// Install the global subscriber: flag first, then config, then `warn`.
fn init_logging(flag: Option<&str>, config: Option<&AppConfig>) {
    let level = flag
        .map(str::to_string)
        .or_else(|| config.map(|c| c.logging.log_level.clone()))
        .unwrap_or_else(|| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// The explicit path, else the first existing default location.
fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    default_config_paths().into_iter().find(|p| p.is_file())
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("shadowdiff").join("config.toml"));
    }
    paths
}

fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    match resolve_config_path(explicit) {
        Some(path) => AppConfig::load_and_validate(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# shadowdiff configuration
# Every section is optional; missing values fall back to the defaults shown.

[logging]
log_level = "warn"

[toolchain]
# Remote toolchain binary, resolved through PATH.
binary = "sfdx"
# Per-project tool directory; staging lives under <tool_dir>/tools/conflicts.
tool_dir = ".sfdx"

[diff]
max_concurrent_hashes = 8
# Optional subdirectories of the package dir to compare (all when empty).
scopes = []
# Glob patterns of relative paths to skip on both sides.
ignore_patterns = []

[project]
# target_username = "me@example.com"
package_dir = "force-app"
manifest = "manifest/package.xml"
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Set project.target_username to your org alias");
    println!(
        "  2. Validate with: shadowdiff validate --config {}",
        output.display()
    );
    println!(
        "  3. Check for conflicts: shadowdiff check --config {} --project .",
        output.display()
    );

    Ok(())
}

fn cmd_validate(explicit: Option<&Path>) -> Result<()> {
    let config = match resolve_config_path(explicit) {
        Some(path) => {
            println!("Validating configuration: {}", path.display());
            println!();

            let config =
                AppConfig::load_from_file(&path).context("failed to parse configuration")?;
            println!("  {}", style::success("TOML structure is valid"));
            config
        }
        None => {
            println!("{}", style::warn("No configuration file found; checking defaults"));
            println!();
            AppConfig::default()
        }
    };

    match config.validate() {
        Ok(()) => println!("  {}", style::success("All fields are valid")),
        Err(e) => {
            println!("  {}", style::error(&format!("Validation error: {}", e)));
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("{}", style::header("Configuration summary:"));
    println!("  Toolchain     : {}", config.toolchain.binary);
    println!("  Tool dir      : {}", config.toolchain.tool_dir);
    println!(
        "  Target org    : {}",
        config
            .project
            .target_username
            .as_deref()
            .unwrap_or("NOT SET (pass --target-username)")
    );
    println!("  Package dir   : {}", config.project.package_dir.display());
    println!("  Manifest      : {}", config.project.manifest.display());
    println!("  Hash workers  : {}", config.diff.max_concurrent_hashes);
    if !config.diff.scopes.is_empty() {
        println!("  Scopes        : {}", config.diff.scopes.join(", "));
    }
    if !config.diff.ignore_patterns.is_empty() {
        println!("  Ignored       : {}", config.diff.ignore_patterns.join(", "));
    }
    println!("  Log level     : {}", config.logging.log_level);
    println!();
    println!("Configuration is valid.");

    Ok(())
}
