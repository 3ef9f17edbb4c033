//! Level-by-level execution of a compiled workflow.
//!
//! The [`Scheduler`] owns the [`RunState`] for one run. For each level it
//! snapshots `FailedJobs` and the halt flag, dispatches every job of the level
//! concurrently, waits for all of them, then records their results before
//! moving on. Every executor workspace it brought up is torn down afterwards,
//! whether the levels finished, were cancelled or panicked.

mod report;
mod state;


pub use report::{CleanupFailure, CleanupReport, JobReport, RunReport, StepReport};
pub use state::{JobRunState, RunSnapshot, RunState};

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::cancellation::{run_with_cleanup, CancellationToken};
use crate::condition::{Condition, ConditionContext};
use crate::config::RunConfig;
use crate::core::{JobStatus, RunEvent};
use crate::errors::{ExecutorError, PipewrightError};
use crate::events::{noop_sink, SharedEventSink};
use crate::executor::{Executor, JobExecution};
use crate::utils::elapsed_ms;
use crate::workflow::{resolve_job_env, CompiledJob, CompiledWorkflow, JobEnv};

type ExecutorMap = BTreeMap<String, Arc<dyn Executor>>;

/// What every job of one level is dispatched against.
struct LevelContext<'a> {
    workflow: &'a CompiledWorkflow,
    executors: &'a ExecutorMap,
    unavailable: &'a BTreeMap<String, String>,
    store: &'a ArtifactStore,
    snapshot: RunSnapshot,
}

/// Drives compiled workflows.
pub struct Scheduler {
    config: RunConfig,
    sink: SharedEventSink,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler that discards events.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            sink: noop_sink(),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Returns the run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs `workflow` to completion.
    ///
    /// Job failures, cancellation and hook failures are reported in the
    /// returned [`RunReport`]; an `Err` means the run could not start.
    pub async fn run(&self, workflow: &CompiledWorkflow) -> Result<RunReport, PipewrightError> {
        self.config.validate()?;
        let started = chrono::Utc::now();
        let run_id = self.config.run_id.as_str();

        let store = ArtifactStore::new(self.config.artifact_root());
        store.prepare().await?;

        info!(
            workflow = %workflow.name,
            run_id,
            levels = workflow.levels.len(),
            jobs = workflow.jobs.len(),
            "Run started"
        );
        self.sink
            .emit(RunEvent::run_started(&workflow.name, run_id, workflow.levels.len()))
            .await;

        let (executors, mut unavailable) = self.create_executors(workflow).await;
        let state = Mutex::new(RunState::new(workflow));
        let cleanup = Mutex::new(CleanupReport::default());

        let (outcome, finished) = run_with_cleanup(
            AssertUnwindSafe(self.drive(workflow, &executors, &mut unavailable, &store, &state))
                .catch_unwind(),
            || self.teardown(&executors, &cleanup),
            self.config.cleanup_timeout,
        )
        .await;

        let mut state = state.into_inner();
        if outcome.is_err() {
            error!(workflow = %workflow.name, "Level loop panicked");
            state.finish_pending(JobStatus::Failure, "scheduler aborted");
        }
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            state.finish_pending(JobStatus::Cancelled, "run cancelled");
        }

        let mut cleanup = cleanup.into_inner();
        if finished.is_none() {
            for name in executors.keys() {
                let reported = cleanup.workspaces_torn_down.contains(name)
                    || cleanup.failures.iter().any(|f| &f.executor == name);
                if !reported {
                    cleanup.failures.push(CleanupFailure {
                        executor: name.clone(),
                        error: "cleanup timed out".to_string(),
                    });
                }
            }
        }

        let report = RunReport {
            run_id: run_id.to_string(),
            workflow: workflow.name.clone(),
            jobs: state.job_reports(workflow),
            levels: workflow.levels.clone(),
            cleanup,
            cancelled,
            duration_ms: elapsed_ms(&started, &chrono::Utc::now()),
        };

        let exit_code = report.exit_code();
        info!(
            workflow = %workflow.name,
            exit_code,
            cancelled,
            failed = ?state.failed_jobs(),
            duration_ms = report.duration_ms,
            "Run finished"
        );
        self.sink
            .emit(RunEvent::run_finished(&workflow.name, exit_code, cancelled))
            .await;
        Ok(report)
    }

    async fn create_executors(
        &self,
        workflow: &CompiledWorkflow,
    ) -> (ExecutorMap, BTreeMap<String, String>) {
        let ctx = self.config.workspace_context();
        let mut executors = ExecutorMap::new();
        let mut unavailable = BTreeMap::new();

        for (name, binding) in &workflow.executors {
            match binding.factory.create(name, &binding.spec, &ctx) {
                Ok(executor) => {
                    executors.insert(name.clone(), executor);
                }
                Err(e) => {
                    error!(executor = %name, error = %e, "Failed to create executor");
                    self.sink.emit(RunEvent::workspace("setup", name, false)).await;
                    unavailable.insert(name.clone(), e.to_string());
                }
            }
        }
        (executors, unavailable)
    }

    async fn setup_workspaces(
        &self,
        workflow: &CompiledWorkflow,
        executors: &ExecutorMap,
        unavailable: &mut BTreeMap<String, String>,
    ) {
        for (name, executor) in executors {
            let Some(binding) = workflow.executors.get(name) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                unavailable.insert(name.clone(), "run cancelled before setup".to_string());
                continue;
            }

            debug!(
                executor = %name,
                kind = %executor.kind(),
                units = binding.units.len(),
                "Setting up workspace"
            );
            let result = executor.setup_workspace(&binding.units).await;
            self.sink
                .emit(RunEvent::workspace("setup", name, result.is_ok()))
                .await;
            if let Err(e) = result {
                error!(
                    executor = %name,
                    jobs = ?binding.jobs,
                    error = %e,
                    "Workspace setup failed"
                );
                unavailable.insert(name.clone(), e.to_string());
            }
        }
    }

    async fn drive(
        &self,
        workflow: &CompiledWorkflow,
        executors: &ExecutorMap,
        unavailable: &mut BTreeMap<String, String>,
        store: &ArtifactStore,
        state: &Mutex<RunState>,
    ) {
        self.setup_workspaces(workflow, executors, unavailable).await;

        for (index, level) in workflow.levels.iter().enumerate() {
            let snapshot = {
                let mut state = state.lock();
                state.mark_running(level);
                state.snapshot()
            };
            debug!(level = index, jobs = ?level, ?snapshot, "Dispatching level");
            self.sink.emit(RunEvent::level_started(index, level)).await;

            let ctx = LevelContext {
                workflow,
                executors,
                unavailable: &*unavailable,
                store,
                snapshot,
            };
            let jobs: Vec<&CompiledJob> =
                level.iter().filter_map(|name| workflow.job(name)).collect();
            let results = join_all(jobs.iter().map(|job| self.run_job(&ctx, job))).await;

            let mut state = state.lock();
            for (job, result) in jobs.into_iter().zip(results) {
                state.record(&job.name, job.continue_on_error, result);
            }
        }
    }

    async fn teardown(&self, executors: &ExecutorMap, cleanup: &Mutex<CleanupReport>) {
        join_all(executors.iter().map(|(name, executor)| async move {
            let result = executor.cleanup_workspace().await;
            self.sink
                .emit(RunEvent::workspace("cleanup", name, result.is_ok()))
                .await;
            let mut cleanup = cleanup.lock();
            match result {
                Ok(()) => {
                    debug!(executor = %name, "Workspace torn down");
                    cleanup.workspaces_torn_down.push(name.clone());
                }
                Err(e) => {
                    warn!(executor = %name, error = %e, "Workspace cleanup failed");
                    cleanup.failures.push(CleanupFailure {
                        executor: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }))
        .await;
    }

    async fn run_job(&self, ctx: &LevelContext<'_>, job: &CompiledJob) -> JobRunState {
        let state = self.gate_and_dispatch(ctx, job).await;
        self.finish(job, state).await
    }

    async fn gate_and_dispatch(&self, ctx: &LevelContext<'_>, job: &CompiledJob) -> JobRunState {
        let condition = match job.parsed_condition() {
            Ok(condition) => condition,
            Err(e) => {
                warn!(job = %job.name, error = %e, "Invalid job condition");
                return JobRunState::finished(JobStatus::Failure, Some(e.to_string()));
            }
        };

        if self.cancel.is_cancelled() && !condition.runs_after_cancel() {
            return JobRunState::finished(JobStatus::Cancelled, Some("run cancelled".to_string()));
        }
        if ctx.snapshot.halted && !condition.runs_after_failure() {
            debug!(job = %job.name, condition = %condition, "Skipped after a required job failed");
            return JobRunState::finished(JobStatus::Skipped, None);
        }

        let base = match resolve_job_env(&job.env, &job.env_providers, &job.name).await {
            Ok(base) => base,
            Err(e) => {
                warn!(job = %job.name, error = %e, "Environment provider failed");
                return JobRunState::finished(JobStatus::Failure, Some(e.to_string()));
            }
        };
        let mut env = JobEnv::new(base, &self.config.run_id, &ctx.workflow.name, &job.name);

        if !self.condition_holds(&condition, ctx.snapshot, &env) {
            info!(job = %job.name, condition = %condition, "Job skipped");
            return JobRunState::finished(JobStatus::Skipped, None);
        }

        let Some(executor) = ctx
            .executors
            .get(&job.executor)
            .filter(|_| !ctx.unavailable.contains_key(&job.executor))
        else {
            let reason = ctx.unavailable.get(&job.executor).cloned().unwrap_or_else(|| {
                ExecutorError::WorkspaceUnavailable {
                    executor: job.executor.clone(),
                }
                .to_string()
            });
            return JobRunState::finished(JobStatus::Failure, Some(reason));
        };

        let started_at = chrono::Utc::now();
        info!(job = %job.name, executor = %job.executor, level = job.level, "Job started");
        self.sink
            .emit(RunEvent::job_started(&job.name, &job.executor))
            .await;

        let mut state = self.dispatch(ctx, job, executor.as_ref(), &mut env).await;
        state.started_at = Some(started_at);
        state
    }

    fn condition_holds(&self, condition: &Condition, snapshot: RunSnapshot, env: &JobEnv) -> bool {
        let vars = env.vars();
        condition.evaluate(&ConditionContext {
            has_failures: snapshot.has_failures,
            cancelled: self.cancel.is_cancelled(),
            env: &vars,
        })
    }

    /// Runs the job hooks: setup, restore, execute, save, cleanup.
    async fn dispatch(
        &self,
        ctx: &LevelContext<'_>,
        job: &CompiledJob,
        executor: &dyn Executor,
        env: &mut JobEnv,
    ) -> JobRunState {
        let state = match executor.setup_job(&job.name, &job.units).await {
            Ok(job_dir) => {
                env.set_job_dir(&job_dir);
                self.execute_in(ctx, job, executor, env, &job_dir).await
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "Job setup failed");
                JobRunState::finished(JobStatus::Failure, Some(e.to_string()))
            }
        };

        if let Err(e) = executor.cleanup_job(&job.name).await {
            warn!(job = %job.name, error = %e, "Job cleanup failed");
        }
        state
    }

    async fn execute_in(
        &self,
        ctx: &LevelContext<'_>,
        job: &CompiledJob,
        executor: &dyn Executor,
        env: &JobEnv,
        job_dir: &Path,
    ) -> JobRunState {
        for input in &job.inputs {
            match executor
                .restore_artifact(ctx.store, &input.name, input.path.as_deref(), &job.name)
                .await
            {
                Ok(manifest) => {
                    debug!(
                        job = %job.name,
                        artifact = %input.name,
                        files = manifest.len(),
                        "Artifact restored"
                    );
                    self.sink
                        .emit(RunEvent::artifact(
                            "restored",
                            &input.name,
                            &job.name,
                            manifest.len(),
                        ))
                        .await;
                }
                Err(e) => {
                    warn!(
                        job = %job.name,
                        artifact = %input.name,
                        error = %e,
                        "Artifact restore failed"
                    );
                    return JobRunState::finished(JobStatus::Failure, Some(e.to_string()));
                }
            }
        }

        let outcome = executor
            .execute_job(JobExecution {
                job,
                env,
                job_dir,
                has_failures: ctx.snapshot.has_failures,
                cancel: &self.cancel,
                sink: self.sink.as_ref(),
            })
            .await;

        let mut state = JobRunState {
            status: outcome.status,
            attempts: outcome
                .steps
                .iter()
                .rev()
                .find(|s| s.attempts > 0)
                .map_or(0, |s| s.attempts),
            error: outcome.error,
            steps: outcome.steps,
            ..JobRunState::default()
        };

        if state.status == JobStatus::Success {
            for (name, path) in &job.outputs {
                match executor.save_artifact(ctx.store, name, path, &job.name).await {
                    Ok(manifest) => {
                        debug!(
                            job = %job.name,
                            artifact = %name,
                            path = %path,
                            files = manifest.len(),
                            "Artifact saved"
                        );
                        self.sink
                            .emit(RunEvent::artifact("saved", name, &job.name, manifest.len()))
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            job = %job.name,
                            artifact = %name,
                            error = %e,
                            "Artifact save failed"
                        );
                        state.status = JobStatus::Failure;
                        state.error = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        state
    }

    async fn finish(&self, job: &CompiledJob, mut state: JobRunState) -> JobRunState {
        if state.finished_at.is_none() {
            state.finished_at = Some(chrono::Utc::now());
        }
        match state.status {
            JobStatus::Failure => warn!(
                job = %job.name,
                required = !job.continue_on_error,
                error = state.error.as_deref().unwrap_or(""),
                "Job failed"
            ),
            status => info!(job = %job.name, %status, "Job finished"),
        }
        self.sink
            .emit(RunEvent::job_finished(
                &job.name,
                state.status,
                state.error.as_deref(),
            ))
            .await;
        state
    }
}
