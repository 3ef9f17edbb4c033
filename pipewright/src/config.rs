//! Run configuration.
//!
//! A run recognises three runtime inputs: its identifier, the host artifact
//! root and a keep-workspace debug flag. They come from builder calls or
//! from `PIPEWRIGHT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::PipewrightError;
use crate::executor::WorkspaceContext;
use crate::utils::generate_run_id;

/// Overrides the run identifier.
pub const RUN_ID_VAR: &str = "PIPEWRIGHT_RUN_ID";
/// Overrides the artifact root.
pub const ARTIFACT_ROOT_VAR: &str = "PIPEWRIGHT_ARTIFACT_ROOT";
/// Overrides the workspace root.
pub const WORKSPACE_ROOT_VAR: &str = "PIPEWRIGHT_WORKSPACE_ROOT";
/// Keeps workspaces on disk when truthy.
pub const KEEP_WORKSPACE_VAR: &str = "PIPEWRIGHT_KEEP_WORKSPACE";

const DEFAULT_ARTIFACT_DIR: &str = "_artifacts";

/// Settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Run identifier.
    pub run_id: String,
    /// Explicit artifact root; see [`RunConfig::artifact_root`].
    pub artifact_root: Option<PathBuf>,
    /// Root for executor workspaces.
    pub workspace_root: PathBuf,
    /// Leave workspaces on disk after the run.
    pub keep_workspace: bool,
    /// Upper bound on workspace teardown.
    pub cleanup_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: generate_run_id(),
            artifact_root: None,
            workspace_root: std::env::temp_dir().join("pipewright"),
            keep_workspace: false,
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

impl RunConfig {
    /// Creates a config with a fresh run id and default paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, PipewrightError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipewrightError> {
        let mut config = Self::default();
        if let Some(id) = lookup(RUN_ID_VAR) {
            config.run_id = id;
        }
        if let Some(root) = lookup(ARTIFACT_ROOT_VAR) {
            config.artifact_root = Some(PathBuf::from(root));
        }
        if let Some(root) = lookup(WORKSPACE_ROOT_VAR) {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(flag) = lookup(KEEP_WORKSPACE_VAR) {
            config.keep_workspace = parse_flag(&flag).ok_or_else(|| {
                PipewrightError::Config(format!("{KEEP_WORKSPACE_VAR} has invalid value '{flag}'"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Sets the artifact root.
    #[must_use]
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = Some(root.into());
        self
    }

    /// Sets the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Sets the keep-workspace flag.
    #[must_use]
    pub fn with_keep_workspace(mut self, keep: bool) -> Self {
        self.keep_workspace = keep;
        self
    }

    /// Sets the teardown bound.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Returns the artifact root.
    ///
    /// Defaults to `<workspace_root>/<run_id>/_artifacts`. The leading
    /// underscore is not allowed in executor names, so no executor
    /// workspace can land on it.
    #[must_use]
    pub fn artifact_root(&self) -> PathBuf {
        self.artifact_root.clone().unwrap_or_else(|| {
            self.workspace_root
                .join(&self.run_id)
                .join(DEFAULT_ARTIFACT_DIR)
        })
    }

    /// Returns the settings executor factories see.
    #[must_use]
    pub fn workspace_context(&self) -> WorkspaceContext {
        WorkspaceContext {
            run_id: self.run_id.clone(),
            workspace_root: self.workspace_root.clone(),
            keep_workspace: self.keep_workspace,
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), PipewrightError> {
        let id = self.run_id.trim();
        if id.is_empty() {
            return Err(PipewrightError::Config("run id cannot be empty".to_string()));
        }
        if id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(PipewrightError::Config(format!(
                "run id '{}' cannot be used as a directory name",
                self.run_id
            )));
        }
        if self.cleanup_timeout.is_zero() {
            return Err(PipewrightError::Config(
                "cleanup timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
