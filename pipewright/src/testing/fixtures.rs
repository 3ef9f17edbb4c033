//! Workflow fixtures and a run harness.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::mocks::{HookLog, RecordingExecutorFactory};
use crate::config::RunConfig;
use crate::events::CollectingEventSink;
use crate::executor::ExecutorKind;
use crate::scheduler::{RunReport, Scheduler};
use crate::workflow::{Compiler, JobSpec, StepSpec, UnitSpec, WorkflowSpec};

/// A unit that exits 0.
#[must_use]
pub fn ok_unit() -> UnitSpec {
    UnitSpec::script("exit 0")
}

/// A unit that exits 1.
#[must_use]
pub fn failing_unit() -> UnitSpec {
    UnitSpec::script("echo failing >&2\nexit 1")
}

/// A job with one step named `run` invoking `unit`.
#[must_use]
pub fn single_step_job(unit: &str) -> JobSpec {
    JobSpec::new().step(StepSpec::new("run", unit))
}

/// `lint` and `test` in level 0, `build` needing both.
#[must_use]
pub fn scenario_levels() -> WorkflowSpec {
    WorkflowSpec::new("levels")
        .unit("ok", ok_unit())
        .job("lint", single_step_job("ok"))
        .job("test", single_step_job("ok"))
        .job("build", single_step_job("ok").needs(["lint", "test"]))
}

/// `test` (failing when `test_fails`) and an `always()` `notify` after it.
#[must_use]
pub fn scenario_notify(test_fails: bool) -> WorkflowSpec {
    WorkflowSpec::new("notify")
        .unit("ok", ok_unit())
        .unit("bad", failing_unit())
        .job("test", single_step_job(if test_fails { "bad" } else { "ok" }))
        .job(
            "notify",
            single_step_job("ok").needs(["test"]).condition("always()"),
        )
}

/// `build` saves `out/` as `dist`; `deploy` restores it under `site/`,
/// where it lands as `site/out/`.
#[must_use]
pub fn scenario_artifacts() -> WorkflowSpec {
    WorkflowSpec::new("artifacts")
        .unit(
            "compile",
            UnitSpec::script(
                "mkdir -p out/assets\n\
                 printf 'hello' > out/index.html\n\
                 printf 'body{}' > out/assets/app.css",
            ),
        )
        .unit(
            "check",
            UnitSpec::script("test \"$(cat site/out/index.html)\" = hello"),
        )
        .job("build", single_step_job("compile").output("dist", "out"))
        .job(
            "deploy",
            single_step_job("check").needs(["build"]).input_at("dist", "site"),
        )
}

/// A scheduler wired to a temp directory, a collecting sink and a recording
/// bare backend.
#[derive(Debug)]
pub struct TestRun {
    dir: TempDir,
    /// Run configuration rooted in the temp directory.
    pub config: RunConfig,
    /// Every event emitted by the run.
    pub sink: Arc<CollectingEventSink>,
    /// Every executor hook call.
    pub log: HookLog,
    factory: RecordingExecutorFactory,
}

impl TestRun {
    /// Creates a harness with a fresh temp directory.
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::new()
            .with_run_id("test-run")
            .with_workspace_root(dir.path().join("workspaces"))
            .with_artifact_root(dir.path().join("artifacts"))
            .with_cleanup_timeout(Duration::from_secs(10));
        let log = HookLog::default();
        Self {
            factory: RecordingExecutorFactory::new(ExecutorKind::Bare, log.clone()),
            dir,
            config,
            sink: Arc::new(CollectingEventSink::new()),
            log,
        }
    }

    /// Makes the executor named `name` fail its workspace setup.
    #[must_use]
    pub fn failing_setup(mut self, name: &str) -> Self {
        self.factory = self.factory.failing_setup(name);
        self
    }

    /// Returns the temp directory.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// A compiler whose bare and container kinds record hook calls.
    #[must_use]
    pub fn compiler(&self) -> Compiler {
        Compiler::new()
            .with_executor_factory(ExecutorKind::Bare, Arc::new(self.factory.clone()))
            .with_executor_factory(
                ExecutorKind::Container,
                Arc::new(RecordingExecutorFactory::new(
                    ExecutorKind::Container,
                    self.log.clone(),
                )),
            )
    }

    /// A scheduler reporting into [`TestRun::sink`].
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.config.clone()).with_event_sink(self.sink.clone())
    }

    /// Compiles and runs `spec`.
    pub async fn run(&self, spec: &WorkflowSpec) -> RunReport {
        let workflow = self.compiler().compile(spec).unwrap();
        self.scheduler().run(&workflow).await.unwrap()
    }
}

impl Default for TestRun {
    fn default() -> Self {
        Self::new()
    }
}
