//! TOML-based configuration for shadowdiff.
//!
//! Every section has defaults, so an empty file (or no file at all) is a
//! valid configuration. The per-run [`ConflictDetectionConfig`] value object
//! lives here too; it is usually built from the `[project]` section plus CLI
//! overrides.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::staging::{StagingPaths, DEFAULT_TOOL_DIR};
use crate::toolchain::DEFAULT_BINARY;
use crate::walker::DEFAULT_MAX_CONCURRENT_HASHES;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External toolchain settings.
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Directory diff tunables.
    #[serde(default)]
    pub diff: DiffConfig,

    /// Defaults for the project being checked.
    #[serde(default)]
    pub project: ProjectConfig,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Toolchain
// ---------------------------------------------------------------------------

/// Which CLI to run and where its project-local state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Binary name or path of the metadata CLI.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Tool directory at the project root (`.sfdx`); the staging area is
    /// `<tool_dir>/tools/conflicts`.
    #[serde(default = "default_tool_dir")]
    pub tool_dir: String,
}

fn default_binary() -> String {
    DEFAULT_BINARY.into()
}
fn default_tool_dir() -> String {
    DEFAULT_TOOL_DIR.into()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            tool_dir: default_tool_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Upper bound on files hashed concurrently.
    #[serde(default = "default_max_concurrent_hashes")]
    pub max_concurrent_hashes: usize,

    /// Sub-directories to compare (e.g. `main/default`). Empty = whole tree.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Glob patterns of relative paths to leave out of both trees.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

fn default_max_concurrent_hashes() -> usize {
    DEFAULT_MAX_CONCURRENT_HASHES
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_concurrent_hashes: default_max_concurrent_hashes(),
            scopes: Vec::new(),
            ignore_patterns: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// Defaults for `check`; each can be overridden on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Username or alias of an already-authenticated org.
    #[serde(default)]
    pub target_username: Option<String>,

    /// Package directory, relative to the project root.
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Manifest listing the metadata to retrieve.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
}

fn default_package_dir() -> PathBuf {
    PathBuf::from("force-app")
}
fn default_manifest() -> PathBuf {
    PathBuf::from("manifest/package.xml")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            target_username: None,
            package_dir: default_package_dir(),
            manifest: default_manifest(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.toolchain.binary.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "toolchain.binary".into(),
                detail: "toolchain binary must not be empty".into(),
            });
        }
        if !is_single_component(&self.toolchain.tool_dir) {
            return Err(ConfigError::InvalidValue {
                field: "toolchain.tool_dir".into(),
                detail: "tool dir must be a single relative directory name".into(),
            });
        }
        if self.diff.max_concurrent_hashes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "diff.max_concurrent_hashes".into(),
                detail: "must be > 0".into(),
            });
        }
        check_project_relative("project.package_dir", &self.project.package_dir)?;
        if StagingPaths::overlaps(&self.project.package_dir, &self.toolchain.tool_dir) {
            return Err(ConfigError::InvalidValue {
                field: "project.package_dir".into(),
                detail: format!(
                    "'{}' overlaps the staging area under '{}'",
                    self.project.package_dir.display(),
                    self.toolchain.tool_dir
                ),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn is_single_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Reject absolute paths and paths that climb out of the project root.
fn check_project_relative(field: &str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: "must not be empty".into(),
        });
    }
    if path.is_absolute() || path.has_root() {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: format!("'{}' must be relative to the project root", path.display()),
        });
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: format!("'{}' must stay inside the project root", path.display()),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-run value object
// ---------------------------------------------------------------------------

/// Inputs of one conflict detection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDetectionConfig {
    target_username: String,
    package_dir: PathBuf,
    manifest: PathBuf,
}

impl ConflictDetectionConfig {
    /// Build and validate the run inputs.
    ///
    /// Only the shape is checked here. Whether the manifest and package
    /// directory exist is checked by the run itself, so those failures are
    /// reported as staging and diff failures respectively.
    pub fn new(
        target_username: impl Into<String>,
        package_dir: impl Into<PathBuf>,
        manifest: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let target_username = target_username.into();
        if target_username.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "target_username".into(),
                detail: "a username or alias is required".into(),
            });
        }
        let package_dir = package_dir.into();
        check_project_relative("package_dir", &package_dir)?;

        Ok(Self {
            target_username,
            package_dir,
            manifest: manifest.into(),
        })
    }

    /// Build from the `[project]` section, with an optional username override.
    pub fn from_project(
        project: &ProjectConfig,
        target_username: Option<String>,
    ) -> Result<Self, ConfigError> {
        let username = target_username
            .or_else(|| project.target_username.clone())
            .unwrap_or_default();
        Self::new(username, project.package_dir.clone(), project.manifest.clone())
    }

    pub fn target_username(&self) -> &str {
        &self.target_username
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }
}
