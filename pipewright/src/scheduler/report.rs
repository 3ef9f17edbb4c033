//! The final run report.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::core::JobStatus;
use crate::errors::PipewrightError;
use crate::utils::Timestamp;

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Final status.
    pub status: JobStatus,
    /// Attempts made; zero when the step never ran.
    pub attempts: u32,
    /// Last error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time across all attempts.
    pub duration_ms: u64,
}

impl StepReport {
    /// A step that never invoked its unit.
    #[must_use]
    pub fn not_run(name: &str, status: JobStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            attempts: 0,
            error: None,
            duration_ms: 0,
        }
    }

    /// Attaches an error message.
    #[must_use]
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// Job name.
    pub name: String,
    /// Final status.
    pub status: JobStatus,
    /// False when the job has `continue_on_error`.
    pub required: bool,
    /// Execution level.
    pub level: usize,
    /// Dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Time between dispatch and completion.
    pub duration_ms: u64,
    /// Why the job did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-step outcomes.
    #[serde(default)]
    pub steps: Vec<StepReport>,
}

impl JobReport {
    /// Whether this job makes the run fail.
    #[must_use]
    pub fn fails_run(&self) -> bool {
        self.required && matches!(self.status, JobStatus::Failure | JobStatus::Cancelled)
    }
}

/// A teardown hook that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Executor name.
    pub executor: String,
    /// What went wrong.
    pub error: String,
}

/// Confirmation of workspace teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Executors whose `cleanup_workspace` hook ran to completion.
    pub workspaces_torn_down: Vec<String>,
    /// Hooks that failed or timed out.
    #[serde(default)]
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Whether every workspace was torn down.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// Workflow name.
    pub workflow: String,
    /// Jobs ordered by level, then name.
    pub jobs: Vec<JobReport>,
    /// The level partition that was executed.
    pub levels: Vec<Vec<String>>,
    /// Teardown confirmation.
    pub cleanup: CleanupReport,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Total wall time.
    pub duration_ms: u64,
}

impl RunReport {
    /// Returns 0 when no required job failed or was cancelled, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.jobs.iter().any(JobReport::fails_run))
    }

    /// Whether the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    /// Looks up a job.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Returns the status of `name`.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<JobStatus> {
        self.job(name).map(|j| j.status)
    }

    /// Jobs that ended in failure.
    #[must_use]
    pub fn failed_jobs(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failure)
            .map(|j| j.name.as_str())
            .collect()
    }

    /// Serializes the report.
    pub fn to_json(&self) -> Result<String, PipewrightError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Renders a per-job status table.
    #[must_use]
    pub fn render_summary(&self) -> String {
        let width = self
            .jobs
            .iter()
            .map(|j| j.name.len())
            .max()
            .unwrap_or(0)
            .max(3);

        let mut out = String::new();
        let _ = writeln!(out, "workflow {} (run {})", self.workflow, self.run_id);
        let _ = writeln!(out, "{:<5} {:<width$} {:<9} {:>9}", "LEVEL", "JOB", "STATUS", "TIME");
        for job in &self.jobs {
            let marker = if job.required { "" } else { " (allowed to fail)" };
            let _ = write!(
                out,
                "{:<5} {:<width$} {:<9} {:>7}ms{marker}",
                job.level,
                job.name,
                job.status.to_string(),
                job.duration_ms,
            );
            if let Some(error) = &job.error {
                let _ = write!(out, "  {error}");
            }
            out.push('\n');
        }

        if self.cancelled {
            out.push_str("run cancelled\n");
        }
        let _ = writeln!(
            out,
            "cleanup: {} workspace(s) torn down{}",
            self.cleanup.workspaces_torn_down.len(),
            if self.cleanup.is_clean() {
                String::new()
            } else {
                format!(", {} failed", self.cleanup.failures.len())
            }
        );
        for failure in &self.cleanup.failures {
            let _ = writeln!(out, "  {}: {}", failure.executor, failure.error);
        }
        let _ = writeln!(out, "exit code {}", self.exit_code());
        out
    }
}
