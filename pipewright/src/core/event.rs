//! Structured run events.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use super::JobStatus;
use crate::retry::Backoff;

/// An event emitted while a run progresses.
///
/// Events are consumed by [`EventSink`](crate::events::EventSink)s for
/// logging and by tests that assert on ordering and retry timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// The event type (e.g., "job.started", "retry.scheduled").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl RunEvent {
    /// Creates an event with no payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: BTreeMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns a string field from the payload.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    /// Returns an unsigned integer field from the payload.
    #[must_use]
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Creates a "run.started" event.
    #[must_use]
    pub fn run_started(workflow: &str, run_id: &str, levels: usize) -> Self {
        Self::new("run.started")
            .add_data("workflow", json!(workflow))
            .add_data("run_id", json!(run_id))
            .add_data("levels", json!(levels))
    }

    /// Creates a "run.finished" event.
    #[must_use]
    pub fn run_finished(workflow: &str, exit_code: i32, cancelled: bool) -> Self {
        Self::new("run.finished")
            .add_data("workflow", json!(workflow))
            .add_data("exit_code", json!(exit_code))
            .add_data("cancelled", json!(cancelled))
    }

    /// Creates a "level.started" event.
    #[must_use]
    pub fn level_started(index: usize, jobs: &[String]) -> Self {
        Self::new("level.started")
            .add_data("level", json!(index))
            .add_data("jobs", json!(jobs))
    }

    /// Creates a "job.started" event.
    #[must_use]
    pub fn job_started(job: &str, executor: &str) -> Self {
        Self::new("job.started")
            .add_data("job", json!(job))
            .add_data("executor", json!(executor))
    }

    /// Creates a "job.finished" event.
    #[must_use]
    pub fn job_finished(job: &str, status: JobStatus, error: Option<&str>) -> Self {
        Self::new("job.finished")
            .add_data("job", json!(job))
            .add_data("status", json!(status))
            .add_data("error", json!(error))
    }

    /// Creates a "step.skipped" event.
    #[must_use]
    pub fn step_skipped(job: &str, step: &str, condition: &str) -> Self {
        Self::new("step.skipped")
            .add_data("job", json!(job))
            .add_data("step", json!(step))
            .add_data("condition", json!(condition))
    }

    /// Creates a "step.finished" event.
    #[must_use]
    pub fn step_finished(job: &str, step: &str, status: JobStatus, attempts: u32) -> Self {
        Self::new("step.finished")
            .add_data("job", json!(job))
            .add_data("step", json!(step))
            .add_data("status", json!(status))
            .add_data("attempts", json!(attempts))
    }

    /// Creates a "retry.attempt" event.
    #[must_use]
    pub fn retry_attempt(label: &str, attempt: u32, max_attempts: u32, backoff: Backoff) -> Self {
        Self::new("retry.attempt")
            .add_data("label", json!(label))
            .add_data("attempt", json!(attempt))
            .add_data("max_attempts", json!(max_attempts))
            .add_data("backoff", json!(backoff))
    }

    /// Creates a "retry.scheduled" event for the sleep before the next attempt.
    #[must_use]
    pub fn retry_scheduled(label: &str, attempt: u32, delay: Duration, backoff: Backoff) -> Self {
        Self::new("retry.scheduled")
            .add_data("label", json!(label))
            .add_data("attempt", json!(attempt))
            .add_data("delay_ms", json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)))
            .add_data("backoff", json!(backoff))
    }

    /// Creates a "retry.exhausted" event.
    #[must_use]
    pub fn retry_exhausted(label: &str, attempts: u32, backoff: Backoff) -> Self {
        Self::new("retry.exhausted")
            .add_data("label", json!(label))
            .add_data("attempts", json!(attempts))
            .add_data("backoff", json!(backoff))
    }

    /// Creates an "artifact.saved" or "artifact.restored" event.
    #[must_use]
    pub fn artifact(kind: &str, name: &str, job: &str, files: usize) -> Self {
        Self::new(format!("artifact.{kind}"))
            .add_data("artifact", json!(name))
            .add_data("job", json!(job))
            .add_data("files", json!(files))
    }

    /// Creates a "workspace.setup" or "workspace.cleanup" event.
    #[must_use]
    pub fn workspace(kind: &str, executor: &str, ok: bool) -> Self {
        Self::new(format!("workspace.{kind}"))
            .add_data("executor", json!(executor))
            .add_data("ok", json!(ok))
    }
}
