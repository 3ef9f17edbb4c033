//! Run-wide bookkeeping owned by the scheduler.
//!
//! Jobs never touch this directly. The scheduler takes a [`RunSnapshot`]
//! before dispatching a level and records every job's result once the whole
//! level has finished, so jobs in one level never race on it.

use std::collections::{BTreeMap, BTreeSet};

use super::report::{JobReport, StepReport};
use crate::core::JobStatus;
use crate::utils::{elapsed_ms, Timestamp};
use crate::workflow::CompiledWorkflow;

/// The tracked state of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunState {
    /// Current status.
    pub status: JobStatus,
    /// Set when the job passed its gates and was handed to its executor.
    pub started_at: Option<Timestamp>,
    /// Set once the job reaches a terminal status.
    pub finished_at: Option<Timestamp>,
    /// Attempts made by the last step that ran.
    pub attempts: u32,
    /// Why the job did not succeed.
    pub error: Option<String>,
    /// Per-step outcomes.
    pub steps: Vec<StepReport>,
}

impl JobRunState {
    /// A terminal state reached without running any step.
    #[must_use]
    pub fn finished(status: JobStatus, error: Option<String>) -> Self {
        Self {
            status,
            finished_at: Some(chrono::Utc::now()),
            error,
            ..Self::default()
        }
    }
}

/// What the next level is gated on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSnapshot {
    /// `FailedJobs` is non-empty.
    pub has_failures: bool,
    /// A required job failed.
    pub halted: bool,
}

/// Statuses, `FailedJobs` and the halt flag for one run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    jobs: BTreeMap<String, JobRunState>,
    failed_jobs: BTreeSet<String>,
    halted: bool,
}

impl RunState {
    /// Creates a state with every job pending.
    #[must_use]
    pub fn new(workflow: &CompiledWorkflow) -> Self {
        Self {
            jobs: workflow
                .jobs
                .keys()
                .map(|name| (name.clone(), JobRunState::default()))
                .collect(),
            failed_jobs: BTreeSet::new(),
            halted: false,
        }
    }

    /// Returns the gating snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            has_failures: !self.failed_jobs.is_empty(),
            halted: self.halted,
        }
    }

    /// Marks `jobs` as running.
    pub fn mark_running<'a>(&mut self, jobs: impl IntoIterator<Item = &'a String>) {
        for job in jobs {
            if let Some(state) = self.jobs.get_mut(job) {
                state.status = JobStatus::Running;
            }
        }
    }

    /// Records a job's terminal state.
    ///
    /// A failure always enters `FailedJobs`; it halts the run unless the job
    /// is allowed to fail.
    pub fn record(&mut self, job: &str, continue_on_error: bool, state: JobRunState) {
        if state.status == JobStatus::Failure {
            self.failed_jobs.insert(job.to_string());
            if !continue_on_error {
                self.halted = true;
            }
        }
        self.jobs.insert(job.to_string(), state);
    }

    /// Returns a job's state.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<&JobRunState> {
        self.jobs.get(name)
    }

    /// Returns a job's status.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.jobs.get(name).map(|s| s.status)
    }

    /// Jobs that failed so far.
    #[must_use]
    pub fn failed_jobs(&self) -> &BTreeSet<String> {
        &self.failed_jobs
    }

    /// Whether a required job failed.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Marks every non-terminal job with `status`.
    ///
    /// Used when the level loop ends abnormally.
    pub fn finish_pending(&mut self, status: JobStatus, error: &str) {
        for state in self.jobs.values_mut() {
            if !state.status.is_terminal() {
                *state = JobRunState::finished(status, Some(error.to_string()));
            }
        }
    }

    /// Builds per-job reports ordered by level, then name.
    #[must_use]
    pub fn job_reports(&self, workflow: &CompiledWorkflow) -> Vec<JobReport> {
        workflow
            .levels
            .iter()
            .flatten()
            .filter_map(|name| {
                let job = workflow.job(name)?;
                let state = self.jobs.get(name).cloned().unwrap_or_default();
                let duration_ms = match (&state.started_at, &state.finished_at) {
                    (Some(start), Some(end)) => elapsed_ms(start, end),
                    _ => 0,
                };
                Some(JobReport {
                    name: name.clone(),
                    status: state.status,
                    required: !job.continue_on_error,
                    level: job.level,
                    started_at: state.started_at,
                    finished_at: state.finished_at,
                    duration_ms,
                    error: state.error,
                    steps: state.steps,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Compiler, JobSpec, StepSpec, UnitSpec, WorkflowSpec};

    fn workflow() -> CompiledWorkflow {
        let job = || JobSpec::new().step(StepSpec::new("run", "noop"));
        let spec = WorkflowSpec::new("ci")
            .unit("noop", UnitSpec::script("true"))
            .job("lint", job())
            .job("test", job())
            .job("build", job().needs(["lint", "test"]));
        Compiler::new().compile(&spec).unwrap()
    }

    #[test]
    fn test_allowed_failure_does_not_halt() {
        let mut state = RunState::new(&workflow());
        state.record("lint", true, JobRunState::finished(JobStatus::Failure, None));

        assert_eq!(
            state.snapshot(),
            RunSnapshot {
                has_failures: true,
                halted: false
            }
        );
        assert!(state.failed_jobs().contains("lint"));
    }

    #[test]
    fn test_required_failure_halts() {
        let mut state = RunState::new(&workflow());
        state.record("test", false, JobRunState::finished(JobStatus::Failure, None));
        assert!(state.is_halted());
    }

    #[test]
    fn test_skipped_and_cancelled_are_not_failures() {
        let mut state = RunState::new(&workflow());
        state.record("lint", false, JobRunState::finished(JobStatus::Skipped, None));
        state.record("test", false, JobRunState::finished(JobStatus::Cancelled, None));

        assert!(state.failed_jobs().is_empty());
        assert!(!state.snapshot().has_failures);
    }

    #[test]
    fn test_reports_follow_level_order() {
        let wf = workflow();
        let mut state = RunState::new(&wf);
        state.mark_running(&wf.levels[0]);
        assert_eq!(state.status("lint"), Some(JobStatus::Running));

        state.finish_pending(JobStatus::Cancelled, "aborted");
        let names: Vec<_> = state
            .job_reports(&wf)
            .into_iter()
            .map(|r| (r.name, r.status))
            .collect();
        assert_eq!(
            names,
            vec![
                ("lint".to_string(), JobStatus::Cancelled),
                ("test".to_string(), JobStatus::Cancelled),
                ("build".to_string(), JobStatus::Cancelled),
            ]
        );
    }
}
