//! Recording executors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::{ExecutorError, UnitError};
use crate::executor::{
    BareExecutor, Executor, ExecutorFactory, ExecutorKind, JobExecution, JobOutcome, UnitRequest,
    WorkspaceContext,
};
use crate::workflow::{ExecutorSpec, UnitSpec};

/// An executor lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// `setup_workspace`
    SetupWorkspace,
    /// `cleanup_workspace`
    CleanupWorkspace,
    /// `setup_job`
    SetupJob,
    /// `execute_job`
    ExecuteJob,
    /// `run_unit`
    RunUnit,
    /// `cleanup_job`
    CleanupJob,
}

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCall {
    /// Executor name.
    pub executor: String,
    /// The hook.
    pub hook: Hook,
    /// The job, for job-level hooks.
    pub job: Option<String>,
    /// Units handed to `setup_workspace`.
    pub units: Vec<String>,
}

/// Hook calls shared by every executor a factory creates.
#[derive(Debug, Clone, Default)]
pub struct HookLog {
    calls: Arc<Mutex<Vec<HookCall>>>,
}

impl HookLog {
    fn push(&self, executor: &str, hook: Hook, job: Option<&str>) {
        self.calls.lock().push(HookCall {
            executor: executor.to_string(),
            hook,
            job: job.map(ToString::to_string),
            units: Vec::new(),
        });
    }

    /// Returns every call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    /// Counts calls of `hook`.
    #[must_use]
    pub fn count(&self, hook: Hook) -> usize {
        self.calls.lock().iter().filter(|c| c.hook == hook).count()
    }

    /// Counts calls of `hook` for `job`.
    #[must_use]
    pub fn count_for_job(&self, hook: Hook, job: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.hook == hook && c.job.as_deref() == Some(job))
            .count()
    }

    /// Returns the position of the first matching call.
    #[must_use]
    pub fn position(&self, hook: Hook, job: Option<&str>) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .position(|c| c.hook == hook && c.job.as_deref() == job)
    }
}

/// A bare executor that records every hook call.
#[derive(Debug)]
pub struct RecordingExecutor {
    inner: BareExecutor,
    kind: ExecutorKind,
    log: HookLog,
    fail_setup: bool,
}

impl RecordingExecutor {
    /// Wraps a bare executor named `name`.
    #[must_use]
    pub fn new(name: &str, kind: ExecutorKind, ctx: &WorkspaceContext, log: HookLog) -> Self {
        Self {
            inner: BareExecutor::new(name, ctx),
            kind,
            log,
            fail_setup: false,
        }
    }

    /// Makes `setup_workspace` fail.
    #[must_use]
    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn setup_workspace(
        &self,
        units: &BTreeMap<String, UnitSpec>,
    ) -> Result<(), ExecutorError> {
        self.log.calls.lock().push(HookCall {
            executor: self.name().to_string(),
            hook: Hook::SetupWorkspace,
            job: None,
            units: units.keys().cloned().collect(),
        });
        if self.fail_setup {
            return Err(ExecutorError::WorkspaceSetup {
                executor: self.name().to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.setup_workspace(units).await
    }

    async fn cleanup_workspace(&self) -> Result<(), ExecutorError> {
        self.log.push(self.name(), Hook::CleanupWorkspace, None);
        self.inner.cleanup_workspace().await
    }

    async fn setup_job(
        &self,
        job: &str,
        units: &BTreeMap<String, UnitSpec>,
    ) -> Result<PathBuf, ExecutorError> {
        self.log.push(self.name(), Hook::SetupJob, Some(job));
        self.inner.setup_job(job, units).await
    }

    async fn run_unit(&self, request: UnitRequest<'_>) -> Result<(), UnitError> {
        self.log.push(self.name(), Hook::RunUnit, Some(request.job));
        self.inner.run_unit(request).await
    }

    async fn execute_job(&self, execution: JobExecution<'_>) -> JobOutcome {
        self.log
            .push(self.name(), Hook::ExecuteJob, Some(&execution.job.name));
        crate::executor::run_steps(self, execution).await
    }

    async fn cleanup_job(&self, job: &str) -> Result<(), ExecutorError> {
        self.log.push(self.name(), Hook::CleanupJob, Some(job));
        self.inner.cleanup_job(job).await
    }

    fn job_dir(&self, job: &str) -> Option<PathBuf> {
        self.inner.job_dir(job)
    }
}

/// Creates [`RecordingExecutor`]s sharing one [`HookLog`].
#[derive(Debug, Clone)]
pub struct RecordingExecutorFactory {
    kind: ExecutorKind,
    log: HookLog,
    fail_setup: BTreeSet<String>,
}

impl RecordingExecutorFactory {
    /// Creates a factory reporting `kind`.
    #[must_use]
    pub fn new(kind: ExecutorKind, log: HookLog) -> Self {
        Self {
            kind,
            log,
            fail_setup: BTreeSet::new(),
        }
    }

    /// Makes the executor named `name` fail its workspace setup.
    #[must_use]
    pub fn failing_setup(mut self, name: impl Into<String>) -> Self {
        self.fail_setup.insert(name.into());
        self
    }
}

impl ExecutorFactory for RecordingExecutorFactory {
    fn create(
        &self,
        name: &str,
        _spec: &ExecutorSpec,
        ctx: &WorkspaceContext,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let executor = RecordingExecutor::new(name, self.kind, ctx, self.log.clone());
        Ok(if self.fail_setup.contains(name) {
            Arc::new(executor.failing_setup())
        } else {
            Arc::new(executor)
        })
    }
}
