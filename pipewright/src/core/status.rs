//! Job and step status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a job (or of a single step inside a job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Failed.
    Failure,
    /// Not run because its condition evaluated false.
    Skipped,
    /// Interrupted or suppressed by run cancellation.
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Returns true if the status is final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if the status counts as a clean outcome for the run.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}
