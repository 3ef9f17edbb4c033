//! Error types for pipewright.
//!
//! Each concern gets its own error enum so callers can match on the failure
//! class: graph and compile errors abort compilation, everything else is
//! recorded against the job (or executor) that hit it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// The top-level error type for pipewright operations.
#[derive(Debug, Error)]
pub enum PipewrightError {
    /// The workflow could not be compiled.
    #[error("{0}")]
    Compile(#[from] CompileError),

    /// A condition expression could not be parsed.
    #[error("{0}")]
    Condition(#[from] ConditionError),

    /// A runnable unit failed.
    #[error("{0}")]
    Unit(#[from] UnitError),

    /// An executor lifecycle hook failed.
    #[error("{0}")]
    Executor(#[from] ExecutorError),

    /// An artifact could not be saved or restored.
    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    /// An environment provider failed.
    #[error("{0}")]
    Env(#[from] EnvError),

    /// The run configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Diagnostic metadata attached to compile-time errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while building the job dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A job lists a `needs` entry that names no job.
    #[error("Job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency {
        /// The job declaring the dependency.
        job: String,
        /// The missing job name.
        dependency: String,
    },

    /// The `needs` relation contains a cycle.
    #[error("Dependency cycle detected at job '{job}': {}", path.join(" -> "))]
    CycleDetected {
        /// A job that participates in the cycle.
        job: String,
        /// The cycle, starting and ending at `job`.
        path: Vec<String>,
    },
}

impl GraphError {
    /// Returns the job this error is reported against.
    #[must_use]
    pub fn job(&self) -> &str {
        match self {
            Self::UnknownDependency { job, .. } | Self::CycleDetected { job, .. } => job,
        }
    }

    /// Returns diagnostic metadata for the error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::UnknownDependency { job, dependency } => ErrorInfo::new(
                "GRAPH-002-UNKNOWN_DEP",
                format!("Job '{job}' depends on '{dependency}', which is not defined"),
            )
            .with_fix_hint("Check the `needs` list for typos or add the missing job.")
            .with_context_entry("job", job.clone())
            .with_context_entry("dependency", dependency.clone()),
            Self::CycleDetected { job, path } => ErrorInfo::new(
                "GRAPH-001-CYCLE",
                format!("Workflow contains a dependency cycle: {}", path.join(" -> ")),
            )
            .with_fix_hint("Remove one of the `needs` edges in the cycle to break it.")
            .with_context_entry("job", job.clone()),
        }
    }
}

/// Errors raised while compiling a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The workflow is structurally invalid.
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    /// The dependency graph is invalid.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A job, step, unit, executor or artifact name is not usable.
    #[error("Invalid {kind} name '{name}'")]
    InvalidName {
        /// What the name identifies.
        kind: &'static str,
        /// The offending name.
        name: String,
    },

    /// Two steps in one job share a name.
    #[error("Job '{job}' declares step '{step}' more than once")]
    DuplicateStep {
        /// The job.
        job: String,
        /// The repeated step name.
        step: String,
    },

    /// A step references a unit that is not defined.
    #[error("Step '{step}' of job '{job}' references unknown unit '{unit}'")]
    UnknownUnit {
        /// The job.
        job: String,
        /// The step.
        step: String,
        /// The missing unit.
        unit: String,
    },

    /// A job references an executor that is not defined.
    #[error("Job '{job}' references unknown executor '{executor}'")]
    UnknownExecutor {
        /// The job.
        job: String,
        /// The missing executor.
        executor: String,
    },

    /// No factory is registered for an executor kind.
    #[error("Executor '{executor}' has kind '{kind}', which has no registered backend")]
    UnsupportedExecutor {
        /// The executor name.
        executor: String,
        /// The unsupported kind.
        kind: String,
    },

    /// A job references an environment provider that is not registered.
    #[error("Job '{job}' references unknown environment provider '{provider}'")]
    UnknownEnvProvider {
        /// The job.
        job: String,
        /// The missing provider.
        provider: String,
    },

    /// Two jobs declare the same output artifact.
    #[error("Artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateArtifact {
        /// The artifact name.
        artifact: String,
        /// The first producing job.
        first: String,
        /// The second producing job.
        second: String,
    },

    /// A job restores an artifact that no job produces.
    #[error("Job '{job}' restores artifact '{artifact}', which no job produces")]
    UnknownArtifact {
        /// The restoring job.
        job: String,
        /// The artifact name.
        artifact: String,
    },

    /// A job restores an artifact produced by a job it does not depend on.
    #[error("Job '{job}' restores artifact '{artifact}' but does not depend on its producer '{producer}'")]
    ArtifactNotUpstream {
        /// The restoring job.
        job: String,
        /// The artifact name.
        artifact: String,
        /// The producing job.
        producer: String,
    },

    /// An artifact path escapes the job directory.
    #[error("Job '{job}' uses invalid path '{path}' for artifact '{artifact}'")]
    InvalidArtifactPath {
        /// The job.
        job: String,
        /// The artifact name.
        artifact: String,
        /// The rejected path.
        path: String,
    },

    /// A retry policy is malformed.
    #[error("Invalid retry policy for {scope}: {reason}")]
    InvalidRetryPolicy {
        /// Where the policy was declared.
        scope: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl CompileError {
    /// Returns diagnostic metadata for the error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::Graph(err) => err.info(),
            Self::DuplicateArtifact { artifact, .. } => {
                ErrorInfo::new("COMPILE-004-DUP_ARTIFACT", self.to_string())
                    .with_fix_hint("Artifact names must be unique per run; rename one output.")
                    .with_context_entry("artifact", artifact.clone())
            }
            Self::ArtifactNotUpstream { producer, .. } => {
                ErrorInfo::new("COMPILE-005-ARTIFACT_ORDER", self.to_string())
                    .with_fix_hint(format!("Add '{producer}' to the job's `needs`."))
            }
            Self::UnsupportedExecutor { .. } => {
                ErrorInfo::new("COMPILE-003-EXECUTOR", self.to_string())
                    .with_fix_hint("Register an executor factory for this kind before compiling.")
            }
            _ => ErrorInfo::new("COMPILE-001-INVALID", self.to_string()),
        }
    }
}

/// Errors raised while parsing a condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// A token appeared where it is not allowed.
    #[error("Unexpected '{token}' at offset {offset} in condition `{expr}`")]
    UnexpectedToken {
        /// The full expression.
        expr: String,
        /// The unexpected token text.
        token: String,
        /// Byte offset of the token.
        offset: usize,
    },

    /// The expression ended early.
    #[error("Unexpected end of condition `{expr}`")]
    UnexpectedEnd {
        /// The full expression.
        expr: String,
    },

    /// A function other than the status built-ins was called.
    #[error("Unknown function '{name}()' in condition `{expr}`")]
    UnknownFunction {
        /// The full expression.
        expr: String,
        /// The function name.
        name: String,
    },

    /// A string literal was not closed.
    #[error("Unterminated string literal in condition `{expr}`")]
    UnterminatedString {
        /// The full expression.
        expr: String,
    },
}

/// Errors raised by a single unit execution attempt.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The unit process could not be started.
    #[error("Failed to start unit '{unit}': {source}")]
    Spawn {
        /// The unit name.
        unit: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The unit exited with a non-zero status.
    #[error("Unit '{unit}' exited with {}", exit_code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    NonZeroExit {
        /// The unit name.
        unit: String,
        /// The exit code, if the process was not killed by a signal.
        exit_code: Option<i32>,
        /// The tail of the unit's stderr.
        stderr: String,
    },

    /// The unit exceeded its timeout.
    #[error("Unit '{unit}' timed out after {timeout_ms}ms")]
    TimedOut {
        /// The unit name.
        unit: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The unit was interrupted by run cancellation.
    #[error("Unit '{unit}' was cancelled")]
    Cancelled {
        /// The unit name.
        unit: String,
    },
}

impl UnitError {
    /// Returns true if the error came from run cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Errors raised by executor lifecycle hooks.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The workspace hook failed.
    #[error("Executor '{executor}' failed to set up its workspace: {reason}")]
    WorkspaceSetup {
        /// The executor name.
        executor: String,
        /// Why it failed.
        reason: String,
    },

    /// A job was bound to an executor whose workspace never came up.
    #[error("Executor '{executor}' has no usable workspace")]
    WorkspaceUnavailable {
        /// The executor name.
        executor: String,
    },

    /// The job hook failed.
    #[error("Executor '{executor}' failed to set up job '{job}': {reason}")]
    JobSetup {
        /// The executor name.
        executor: String,
        /// The job name.
        job: String,
        /// Why it failed.
        reason: String,
    },

    /// A filesystem operation inside a hook failed.
    #[error("Executor '{executor}' failed to {operation} '{}': {source}", path.display())]
    Io {
        /// The executor name.
        executor: String,
        /// What was being done.
        operation: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ExecutorError {
    /// Creates an IO error with path context.
    pub fn io(
        executor: impl Into<String>,
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            executor: executor.into(),
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while saving or restoring artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// No artifact with this name has been saved in the run.
    #[error("Unknown artifact '{name}'")]
    Unknown {
        /// The artifact name.
        name: String,
    },

    /// The path to save does not exist in the job directory.
    #[error("Job '{job}' has nothing at '{path}' to save as artifact '{name}'")]
    SourceMissing {
        /// The artifact name.
        name: String,
        /// The saving job.
        job: String,
        /// The missing relative path.
        path: String,
    },

    /// The relative path is absolute or escapes its root.
    #[error("Invalid artifact path '{path}'")]
    InvalidPath {
        /// The rejected path.
        path: String,
    },

    /// The executor has no host-visible directory for the job.
    #[error("Job '{job}' has no working directory")]
    NoJobDirectory {
        /// The job name.
        job: String,
    },

    /// A copy failed.
    #[error("Failed to copy artifact '{name}' at '{}': {source}", path.display())]
    Copy {
        /// The artifact name.
        name: String,
        /// The path being copied.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by environment providers.
#[derive(Debug, Clone, Error)]
#[error("Environment provider '{provider}' failed: {reason}")]
pub struct EnvError {
    /// The provider name.
    pub provider: String,
    /// Why it failed.
    pub reason: String,
}

impl EnvError {
    /// Creates a new environment provider error.
    #[must_use]
    pub fn new(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}
