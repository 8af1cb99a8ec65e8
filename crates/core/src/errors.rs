//! Error types for the shadowdiff core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Detection(#[from] ConflictDetectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Diff errors
// ---------------------------------------------------------------------------

/// Errors from hashing, walking, and diffing directory trees.
#[derive(Debug, Error)]
pub enum DiffError {
    /// A file or directory could not be read.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The walk root exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Directory traversal failed part-way through.
    #[error("directory walk failed: {0}")]
    Walk(String),

    /// A hashing task panicked or was aborted.
    #[error("hashing task failed: {0}")]
    TaskFailed(String),
}

impl DiffError {
    /// Wrap an I/O error together with the path that produced it.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// The underlying I/O error kind, if this is an I/O failure.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Toolchain errors
// ---------------------------------------------------------------------------

/// Errors from running an external toolchain step.
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// The toolchain binary was not found on `$PATH`.
    #[error("toolchain binary not found: {0}")]
    BinaryNotFound(String),

    /// The step exited with a non-zero status.
    #[error("{step} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        step: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The caller's cancellation token fired while the step was running.
    #[error("{step} was cancelled")]
    Cancelled { step: String },

    /// Generic I/O wrapper (spawn / pipe failures).
    #[error("toolchain I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict detection errors
// ---------------------------------------------------------------------------

/// Terminal failures of a conflict detection run.
///
/// Cleanup failures are deliberately absent: they are logged and reported
/// on the successful [`ConflictReport`](crate::detector::ConflictReport),
/// never surfaced as a failed run.
#[derive(Debug, Error)]
pub enum ConflictDetectionError {
    /// Creating the staging directory or copying the manifest failed.
    #[error("failed to prepare staging area: {detail}")]
    StagingFailed { detail: String },

    /// The retrieval or conversion step exited with a non-zero status.
    #[error("{step} failed (exit {exit_code}): {output}")]
    ExternalStepFailed {
        step: String,
        exit_code: i32,
        output: String,
    },

    /// The run was cancelled while an external step was outstanding.
    #[error("conflict detection cancelled during {stage}")]
    Cancelled { stage: String },

    /// The retrieved archive was missing or could not be extracted.
    #[error("failed to extract '{archive}': {detail}")]
    UnpackFailed { archive: String, detail: String },

    /// Walking or hashing either tree failed.
    #[error("failed to diff local and remote trees: {0}")]
    DiffFailed(#[from] DiffError),

    /// Another run for the same project root is still in flight.
    #[error("conflict detection already running for '{project_root}'")]
    AlreadyRunning { project_root: String },
}

impl ConflictDetectionError {
    /// `true` for user-initiated cancellation, as opposed to a real error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Short stage tag used in structured log events.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::StagingFailed { .. } => "staging",
            Self::ExternalStepFailed { .. } => "external_step",
            Self::Cancelled { .. } => "cancelled",
            Self::UnpackFailed { .. } => "unpack",
            Self::DiffFailed(_) => "diff",
            Self::AlreadyRunning { .. } => "admission",
        }
    }

    /// Map a toolchain failure onto the pipeline taxonomy.
    ///
    /// `ExternalStepFailed::step` always carries the step's log name;
    /// `stage` only names where a cancellation landed.
    pub(crate) fn from_toolchain(err: ToolchainError, log_name: &str, stage: &str) -> Self {
        match err {
            ToolchainError::Cancelled { .. } => Self::Cancelled {
                stage: stage.to_string(),
            },
            ToolchainError::CommandFailed {
                exit_code,
                stdout,
                stderr,
                ..
            } => Self::ExternalStepFailed {
                step: log_name.to_string(),
                exit_code,
                output: combine_output(&stdout, &stderr),
            },
            ToolchainError::BinaryNotFound(bin) => Self::ExternalStepFailed {
                step: log_name.to_string(),
                exit_code: -1,
                output: format!("toolchain binary not found: {}", bin),
            },
            ToolchainError::Io(e) => Self::ExternalStepFailed {
                step: log_name.to_string(),
                exit_code: -1,
                output: e.to_string(),
            },
        }
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim(), stderr.trim()) {
        ("", err) => err.to_string(),
        (out, "") => out.to_string(),
        (out, err) => format!("{}\n{}", err, out),
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
