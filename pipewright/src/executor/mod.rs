//! The executor lifecycle contract.
//!
//! An executor binds jobs to an execution environment through five hooks:
//!
//! 1. [`Executor::setup_workspace`] once per executor identity, with every
//!    unit any bound job will run
//! 2. [`Executor::setup_job`] per job, returning an isolated working directory
//! 3. [`Executor::execute_job`] runs the job's steps there
//! 4. [`Executor::cleanup_job`] tears down job-local state
//! 5. [`Executor::cleanup_workspace`] once, after every level, even on
//!    cancellation or a fatal error
//!
//! plus [`Executor::save_artifact`] and [`Executor::restore_artifact`], which
//! the scheduler calls around `execute_job`. Executors whose job directories
//! are not host paths override those two.
//!
//! Backends are created by an [`ExecutorFactory`] registered for an
//! [`ExecutorKind`]. Only [`ExecutorKind::Bare`] ships with the crate.

mod bare;
mod step;

pub use bare::{BareExecutor, BareExecutorFactory};
pub use step::{run_steps, JobExecution, JobOutcome};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifacts::{ArtifactManifest, ArtifactStore};
use crate::cancellation::CancellationToken;
use crate::errors::{ArtifactError, ExecutorError, UnitError};
use crate::workflow::{ExecutorSpec, UnitSpec};

/// The kind of environment an executor drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Plain host processes.
    #[default]
    Bare,
    /// A container runtime.
    Container,
    /// A remote host.
    Remote,
    /// A cluster scheduler.
    Cluster,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bare => write!(f, "bare"),
            Self::Container => write!(f, "container"),
            Self::Remote => write!(f, "remote"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Run-wide settings handed to executor factories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceContext {
    /// The run identifier.
    pub run_id: String,
    /// Root under which run-scoped workspaces are created.
    pub workspace_root: PathBuf,
    /// Leave workspaces on disk after the run.
    pub keep_workspace: bool,
}

/// One unit invocation.
#[derive(Debug, Clone, Copy)]
pub struct UnitRequest<'a> {
    /// The job.
    pub job: &'a str,
    /// The step.
    pub step: &'a str,
    /// The unit name.
    pub unit_name: &'a str,
    /// The unit.
    pub unit: &'a UnitSpec,
    /// The fully resolved step environment.
    pub env: &'a BTreeMap<String, String>,
    /// The job's working directory.
    pub job_dir: &'a Path,
    /// Fires when the run is cancelled.
    pub cancel: &'a CancellationToken,
}

/// An execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The executor identity. Jobs naming the same executor share it.
    fn name(&self) -> &str;

    /// The backend kind.
    fn kind(&self) -> ExecutorKind;

    /// Provisions the shared workspace.
    async fn setup_workspace(
        &self,
        units: &BTreeMap<String, UnitSpec>,
    ) -> Result<(), ExecutorError>;

    /// Tears down the shared workspace. Must tolerate a failed or skipped setup.
    async fn cleanup_workspace(&self) -> Result<(), ExecutorError>;

    /// Creates the job's isolated working directory and returns it.
    async fn setup_job(
        &self,
        job: &str,
        units: &BTreeMap<String, UnitSpec>,
    ) -> Result<PathBuf, ExecutorError>;

    /// Runs one unit to completion.
    async fn run_unit(&self, request: UnitRequest<'_>) -> Result<(), UnitError>;

    /// Runs the job's steps, each gated by its condition and wrapped in retry.
    async fn execute_job(&self, execution: JobExecution<'_>) -> JobOutcome {
        run_steps(self, execution).await
    }

    /// Tears down job-local state.
    async fn cleanup_job(&self, job: &str) -> Result<(), ExecutorError>;

    /// Returns the host path of the job's working directory.
    fn job_dir(&self, job: &str) -> Option<PathBuf>;

    /// Copies `path` from the job directory into the artifact store.
    async fn save_artifact(
        &self,
        store: &ArtifactStore,
        name: &str,
        path: &str,
        job: &str,
    ) -> Result<ArtifactManifest, ArtifactError> {
        let dir = self.job_dir(job).ok_or_else(|| ArtifactError::NoJobDirectory {
            job: job.to_string(),
        })?;
        store.save(name, path, job, &dir).await
    }

    /// Copies a stored artifact into the job directory under `target`.
    async fn restore_artifact(
        &self,
        store: &ArtifactStore,
        name: &str,
        target: Option<&str>,
        job: &str,
    ) -> Result<ArtifactManifest, ArtifactError> {
        let dir = self.job_dir(job).ok_or_else(|| ArtifactError::NoJobDirectory {
            job: job.to_string(),
        })?;
        store.restore(name, target, &dir).await
    }
}

/// Creates executors of one kind.
pub trait ExecutorFactory: Send + Sync + fmt::Debug {
    /// Creates the executor named `name`.
    fn create(
        &self,
        name: &str,
        spec: &ExecutorSpec,
        ctx: &WorkspaceContext,
    ) -> Result<Arc<dyn Executor>, ExecutorError>;
}

/// Factories by executor kind.
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    factories: BTreeMap<ExecutorKind, Arc<dyn ExecutorFactory>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the bare-process backend.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ExecutorKind::Bare, Arc::new(BareExecutorFactory));
        registry
    }

    /// Registers a factory, replacing any previous one for `kind`.
    pub fn register(&mut self, kind: ExecutorKind, factory: Arc<dyn ExecutorFactory>) {
        self.factories.insert(kind, factory);
    }

    /// Looks up the factory for `kind`.
    #[must_use]
    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn ExecutorFactory>> {
        self.factories.get(&kind).cloned()
    }

    /// Returns the registered kinds.
    #[must_use]
    pub fn kinds(&self) -> Vec<ExecutorKind> {
        self.factories.keys().copied().collect()
    }
}
