//! The `check` command: run conflict detection and render the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};

use shadowdiff_core::config::{AppConfig, ConflictDetectionConfig};
use shadowdiff_core::{CancellationToken, ConflictDetectionError, ConflictDetector, ConflictReport};

use crate::signals;
use crate::style;

/// Overrides for the `[project]` section given on the command line.
#[derive(Debug, Default)]
pub struct CheckArgs {
    pub project: PathBuf,
    pub target_username: Option<String>,
    pub package_dir: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub json: bool,
}

/// How a check ended, mapped onto the process exit code by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Clean,
    Conflicts,
    Cancelled,
}

impl CheckOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Conflicts => 1,
            Self::Cancelled => 130,
        }
    }
}

/// Build the run inputs from the config file and command-line overrides.
pub fn detection_config(config: &AppConfig, args: &CheckArgs) -> Result<ConflictDetectionConfig> {
    let mut project = config.project.clone();
    if let Some(ref dir) = args.package_dir {
        project.package_dir = dir.clone();
    }
    if let Some(ref manifest) = args.manifest {
        project.manifest = manifest.clone();
    }
    ConflictDetectionConfig::from_project(&project, args.target_username.clone())
        .context("invalid check parameters")
}

pub async fn run_check(config: &AppConfig, args: CheckArgs) -> Result<CheckOutcome> {
    let project_root = std::fs::canonicalize(&args.project)
        .with_context(|| format!("project directory not found: {}", args.project.display()))?;
    let detection = detection_config(config, &args)?;
    let detector = ConflictDetector::from_config(config);

    let cancel = CancellationToken::new();
    signals::cancel_on_shutdown(cancel.clone());

    let spinner = spinner(args.json, &project_root)?;
    let result = detector
        .check_for_conflicts(&project_root, &detection, cancel.clone())
        .await;
    spinner.finish_and_clear();
    // Stops the signal watcher.
    cancel.cancel();

    match result {
        Ok(report) => {
            if args.json {
                let json = serde_json::to_string_pretty(&report)
                    .context("failed to serialize report")?;
                println!("{}", json);
            } else {
                print_report(&report);
            }
            Ok(if report.has_conflicts() {
                CheckOutcome::Conflicts
            } else {
                CheckOutcome::Clean
            })
        }
        Err(ConflictDetectionError::Cancelled { stage }) => {
            if !args.json {
                eprintln!(
                    "{}",
                    style::warn(&format!("Check cancelled during {}", style::stage(&stage)))
                );
            }
            Ok(CheckOutcome::Cancelled)
        }
        Err(e) => Err(anyhow::Error::new(e).context("conflict detection failed")),
    }
}

fn spinner(hidden: bool, project_root: &Path) -> Result<ProgressBar> {
    if hidden || !console::Term::stderr().is_term() {
        return Ok(ProgressBar::hidden());
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .context("invalid progress template")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(format!(
        "Checking {} against the remote org...",
        project_root.display()
    ));
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

fn print_report(report: &ConflictReport) {
    println!();
    for step in &report.steps {
        println!(
            "  {}",
            style::step_line(&step.log_name, step.elapsed.as_secs_f64())
        );
    }
    if let Some(ref detail) = report.cleanup_error {
        println!("  {}", style::warn(&format!("Staging cleanup failed: {}", detail)));
    }
    println!();

    let diff = &report.diff;
    if diff.is_clean() {
        println!(
            "{}",
            style::success(&format!(
                "No conflicts ({} local, {} remote files scanned)",
                diff.scanned_local, diff.scanned_remote
            ))
        );
        println!();
        return;
    }

    println!(
        "{}",
        style::header(&format!("Conflicts ({})", diff.different.len()))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["File", "Local path"]);
    for entry in &diff.different {
        table.add_row(vec![
            Cell::new(&entry.relative_path),
            Cell::new(entry.local_path.display()),
        ]);
    }

    println!("{}", table);
    println!();
    println!(
        "{}",
        style::error("Remote changes would be overwritten. Retrieve and merge them before pushing.")
    );
    println!();
}
