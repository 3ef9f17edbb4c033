//! Step sequencing shared by executors.

use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use super::{Executor, UnitRequest};
use crate::cancellation::CancellationToken;
use crate::condition::{Condition, ConditionContext};
use crate::core::{JobStatus, RunEvent};
use crate::events::EventSink;
use crate::retry::{run_with_retry, RetryContext};
use crate::scheduler::StepReport;
use crate::workflow::{CompiledJob, JobEnv};

/// Everything an executor needs to run a job's steps.
#[derive(Clone, Copy)]
pub struct JobExecution<'a> {
    /// The job.
    pub job: &'a CompiledJob,
    /// The job's resolved environment.
    pub env: &'a JobEnv,
    /// The job's working directory.
    pub job_dir: &'a Path,
    /// Whether any job had failed when this one was dispatched.
    pub has_failures: bool,
    /// Run cancellation.
    pub cancel: &'a CancellationToken,
    /// Receives step and retry events.
    pub sink: &'a dyn EventSink,
}

/// The result of running a job's steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Success, failure or cancelled.
    pub status: JobStatus,
    /// One report per declared step.
    pub steps: Vec<StepReport>,
    /// Why the job did not succeed.
    pub error: Option<String>,
}

/// Runs `execution.job`'s steps in order on `executor`.
///
/// The first failing step aborts the job unless it is marked
/// `continue_on_error`; steps skipped by their own condition are not
/// failures. Steps after an abort are reported as skipped.
///
/// A step without a condition runs whenever its job runs, unless the run is
/// cancelled while the job is in progress. An explicit step condition sees
/// `failure()` when any job had failed at dispatch or an earlier step of
/// this job failed.
pub async fn run_steps<E: Executor + ?Sized>(
    executor: &E,
    execution: JobExecution<'_>,
) -> JobOutcome {
    let job = execution.job;
    let env = execution.env;
    let job_dir = execution.job_dir;
    let cancel = execution.cancel;

    let cancelled_at_start = cancel.is_cancelled();
    // Jobs admitted after cancellation run their units to completion.
    let detached = CancellationToken::new();
    let unit_cancel = if cancelled_at_start { &detached } else { cancel };
    let mut step_failed = false;
    let mut status = JobStatus::Success;
    let mut error = None;
    let mut steps = Vec::with_capacity(job.steps.len());

    for step in &job.steps {
        if status != JobStatus::Success {
            steps.push(StepReport::not_run(&step.name, JobStatus::Skipped));
            continue;
        }

        let explicit = step.condition.as_deref().is_some_and(|c| !c.trim().is_empty());
        let condition = match Condition::parse(step.condition.as_deref().unwrap_or("")) {
            Ok(condition) => condition,
            Err(e) => {
                warn!(job = %job.name, step = %step.name, error = %e, "Invalid step condition");
                steps.push(
                    StepReport::not_run(&step.name, JobStatus::Failure).with_error(e.to_string()),
                );
                status = JobStatus::Failure;
                error = Some(e.to_string());
                continue;
            }
        };

        let cancelled = cancel.is_cancelled();
        let interrupted = if explicit {
            cancelled && !condition.runs_after_cancel()
        } else {
            cancelled && !cancelled_at_start
        };
        if interrupted {
            steps.push(StepReport::not_run(&step.name, JobStatus::Cancelled));
            status = JobStatus::Cancelled;
            error = Some("run cancelled".to_string());
            continue;
        }

        let preview = env.for_step(&step.env, &step.name, 1);
        let ctx = ConditionContext {
            has_failures: execution.has_failures || step_failed,
            cancelled,
            env: &preview,
        };
        if explicit && !condition.evaluate(&ctx) {
            info!(job = %job.name, step = %step.name, condition = %condition, "Step skipped");
            execution
                .sink
                .emit(RunEvent::step_skipped(&job.name, &step.name, &condition.to_string()))
                .await;
            steps.push(StepReport::not_run(&step.name, JobStatus::Skipped));
            continue;
        }

        let Some(unit) = job.units.get(&step.unit) else {
            let message = format!("unit '{}' is not available to job '{}'", step.unit, job.name);
            steps.push(
                StepReport::not_run(&step.name, JobStatus::Failure).with_error(message.clone()),
            );
            status = JobStatus::Failure;
            error = Some(message);
            continue;
        };

        let label = format!("{}/{}", job.name, step.name);
        let started = Instant::now();
        let outcome = run_with_retry(
            step.retry.as_ref(),
            RetryContext {
                label: &label,
                unit: &step.unit,
                sink: execution.sink,
                cancel: unit_cancel,
                timeout: step.timeout,
            },
            |attempt| {
                let vars = env.for_step(&step.env, &step.name, attempt);
                async move {
                    executor
                        .run_unit(UnitRequest {
                            job: &job.name,
                            step: &step.name,
                            unit_name: &step.unit,
                            unit,
                            env: &vars,
                            job_dir,
                            cancel: unit_cancel,
                        })
                        .await
                }
            },
        )
        .await;

        let mut report = StepReport {
            name: step.name.clone(),
            status: JobStatus::Success,
            attempts: outcome.attempts,
            error: None,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        match outcome.result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                report.status = JobStatus::Cancelled;
                report.error = Some(e.to_string());
                status = JobStatus::Cancelled;
                error = Some(e.to_string());
            }
            Err(e) => {
                report.status = JobStatus::Failure;
                report.error = Some(e.to_string());
                step_failed = true;
                if step.continue_on_error {
                    warn!(
                        job = %job.name,
                        step = %step.name,
                        error = %e,
                        "Step failed, continuing"
                    );
                } else {
                    status = JobStatus::Failure;
                    error = Some(format!("step '{}' failed: {e}", step.name));
                }
            }
        }

        execution
            .sink
            .emit(RunEvent::step_finished(
                &job.name,
                &step.name,
                report.status,
                report.attempts,
            ))
            .await;
        steps.push(report);
    }

    JobOutcome {
        status,
        steps,
        error,
    }
}
