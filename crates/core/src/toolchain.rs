//! External toolchain adapter.
//!
//! The detector needs two external steps: retrieve remote metadata into the
//! staging area, and convert it into source format. [`ToolchainAdapter`] is
//! the seam; [`CliToolchain`] is the production implementation that shells
//! out to the metadata CLI.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::ToolchainError;

/// Default metadata CLI binary.
pub const DEFAULT_BINARY: &str = "sfdx";

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One external step, described by its logical parameters.
///
/// Paths are interpreted relative to the working directory the step runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainStep {
    /// Retrieve the components listed in `manifest` into `target_dir`.
    Retrieve {
        target_dir: PathBuf,
        manifest: PathBuf,
        target_username: String,
    },
    /// Convert a retrieved metadata tree into source format.
    Convert {
        root_dir: PathBuf,
        output_dir: PathBuf,
    },
}

impl ToolchainStep {
    /// Stable name used for logging and timing.
    pub fn log_name(&self) -> &'static str {
        match self {
            Self::Retrieve { .. } => "conflict_detect_retrieve_org_source",
            Self::Convert { .. } => "conflict_detect_convert_org_source",
        }
    }

    /// Human-readable description, e.g. for a progress indicator.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Retrieve { .. } => "Retrieving org source",
            Self::Convert { .. } => "Converting org source",
        }
    }

    /// Build the command line for this step.
    pub fn to_command(&self, binary: &str) -> ToolchainCommand {
        let mut args: Vec<String> = Vec::new();
        match self {
            Self::Retrieve {
                target_dir,
                manifest,
                target_username,
            } => {
                args.push("force:mdapi:retrieve".into());
                push_flag(&mut args, "--retrievetargetdir", &target_dir.display().to_string());
                push_flag(&mut args, "--unpackaged", &manifest.display().to_string());
                push_flag(&mut args, "--targetusername", target_username);
            }
            Self::Convert {
                root_dir,
                output_dir,
            } => {
                args.push("force:mdapi:convert".into());
                push_flag(&mut args, "--rootdir", &root_dir.display().to_string());
                push_flag(&mut args, "--outputdir", &output_dir.display().to_string());
            }
        }

        ToolchainCommand {
            binary: binary.to_string(),
            args,
            description: self.description().to_string(),
            log_name: self.log_name().to_string(),
        }
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

/// A fully built command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainCommand {
    pub binary: String,
    pub args: Vec<String>,
    pub description: String,
    pub log_name: String,
}

impl fmt::Display for ToolchainCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Completion record of one external step, including its timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletion {
    pub log_name: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Runs one external step to completion or cancellation.
///
/// Implementations must terminate the underlying process and return
/// [`ToolchainError::Cancelled`] once `cancel` fires, and must report a
/// non-zero exit as [`ToolchainError::CommandFailed`] with captured output.
#[async_trait]
pub trait ToolchainAdapter: Send + Sync {
    async fn run(
        &self,
        step: &ToolchainStep,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepCompletion, ToolchainError>;
}

// ---------------------------------------------------------------------------
// CLI implementation
// ---------------------------------------------------------------------------

/// Shells out to the metadata CLI for each step.
#[derive(Debug, Clone)]
pub struct CliToolchain {
    binary: String,
}

impl Default for CliToolchain {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl CliToolchain {
    pub fn new(binary: impl Into<String>) -> Self {
        let toolchain = Self {
            binary: binary.into(),
        };
        debug!(binary = %toolchain.binary, "created CliToolchain");
        toolchain
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl ToolchainAdapter for CliToolchain {
    #[instrument(skip(self, cancel), fields(step = step.log_name(), cwd = %working_dir.display()))]
    async fn run(
        &self,
        step: &ToolchainStep,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepCompletion, ToolchainError> {
        let command = step.to_command(&self.binary);
        let log_name = command.log_name.clone();

        if cancel.is_cancelled() {
            return Err(ToolchainError::Cancelled { step: log_name });
        }

        let mut cmd = Command::new(&command.binary);
        cmd.args(&command.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation also reaches anything the CLI forks.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(cmd = %command, "running toolchain command");
        let started_at = Utc::now();
        let clock = Instant::now();

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolchainError::BinaryNotFound(command.binary.clone())
            } else {
                ToolchainError::Io(e)
            }
        })?;

        #[cfg(unix)]
        let pid = child.id();

        // Dropping the output future on cancellation drops the child, which
        // kills it (kill_on_drop); the rest of its group is killed explicitly.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                #[cfg(unix)]
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                info!(step = %log_name, "toolchain step cancelled, process terminated");
                return Err(ToolchainError::Cancelled { step: log_name });
            }
            output = child.wait_with_output() => output?,
        };

        let elapsed = clock.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            warn!(step = %log_name, exit_code, %stderr, "toolchain step failed");
            return Err(ToolchainError::CommandFailed {
                step: log_name,
                exit_code,
                stdout,
                stderr,
            });
        }

        info!(
            step = %log_name,
            elapsed_ms = elapsed.as_millis() as u64,
            "toolchain step completed"
        );
        Ok(StepCompletion {
            log_name,
            started_at,
            elapsed,
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Send SIGKILL to every process in the group led by `pgid`.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg only signals processes; an already-empty group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::StagingPaths;

    fn retrieve_step() -> ToolchainStep {
        let staging = StagingPaths::relative(".sfdx");
        ToolchainStep::Retrieve {
            target_dir: staging.root,
            manifest: staging.manifest,
            target_username: "MyOrg".into(),
        }
    }

    #[test]
    fn test_build_retrieve_command() {
        let staging = StagingPaths::relative(".sfdx");
        let command = retrieve_step().to_command("sfdx");

        assert_eq!(
            command.to_string(),
            format!(
                "sfdx force:mdapi:retrieve --retrievetargetdir {} --unpackaged {} --targetusername MyOrg",
                staging.root.display(),
                staging.manifest.display()
            )
        );
        assert_eq!(command.log_name, "conflict_detect_retrieve_org_source");
        assert_eq!(command.description, "Retrieving org source");
    }

    #[test]
    fn test_build_convert_command() {
        let staging = StagingPaths::relative(".sfdx");
        let step = ToolchainStep::Convert {
            root_dir: staging.unpackaged.clone(),
            output_dir: staging.converted.clone(),
        };
        let command = step.to_command("sfdx");

        assert_eq!(
            command.to_string(),
            format!(
                "sfdx force:mdapi:convert --rootdir {} --outputdir {}",
                staging.unpackaged.display(),
                staging.converted.display()
            )
        );
        assert_eq!(command.log_name, "conflict_detect_convert_org_source");
    }

    #[test]
    fn test_custom_binary() {
        let command = retrieve_step().to_command("/opt/sf/bin/sfdx");
        assert_eq!(command.binary, "/opt/sf/bin/sfdx");
        assert_eq!(command.args[0], "force:mdapi:retrieve");
    }

    #[tokio::test]
    async fn test_missing_binary_reported() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CliToolchain::new("shadowdiff-no-such-binary-7c1f");
        let err = toolchain
            .run(&retrieve_step(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolchainError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_already_cancelled_token_skips_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CliToolchain::new("shadowdiff-no-such-binary-7c1f")
            .run(&retrieve_step(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolchainError::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        // `false` ignores its arguments and exits 1.
        let dir = tempfile::tempdir().unwrap();
        let err = CliToolchain::new("false")
            .run(&retrieve_step(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ToolchainError::CommandFailed { exit_code, step, .. } => {
                assert_eq!(exit_code, 1);
                assert_eq!(step, "conflict_detect_retrieve_org_source");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_records_completion() {
        // `true` ignores its arguments and exits 0.
        let dir = tempfile::tempdir().unwrap();
        let completion = CliToolchain::new("true")
            .run(&retrieve_step(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.exit_code, 0);
        assert_eq!(completion.log_name, "conflict_detect_retrieve_org_source");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_terminates_long_running_step() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-sfdx");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let clock = Instant::now();
        let err = CliToolchain::new(script.display().to_string())
            .run(&retrieve_step(), dir.path(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ToolchainError::Cancelled { .. }));
        assert!(clock.elapsed() < Duration::from_secs(10));
    }

    /// Liveness via procfs; zombies count as dead since they only await reaping.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancellation_kills_forked_children() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("forking-sfdx");
        std::fs::write(
            &script,
            "#!/bin/sh\nsleep 30 &\necho $! > grandchild.pid\nwait\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let pid_file = dir.path().join("grandchild.pid");
        let watched = pid_file.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                if std::fs::read_to_string(&watched).map_or(false, |s| !s.trim().is_empty()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let err = CliToolchain::new(script.display().to_string())
            .run(&retrieve_step(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolchainError::Cancelled { .. }));

        let grandchild: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..100 {
            alive = is_running(grandchild);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "forked child {} survived cancellation", grandchild);
    }
}
