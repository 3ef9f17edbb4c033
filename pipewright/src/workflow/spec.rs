//! Declarative workflow documents.
//!
//! A [`WorkflowSpec`] is what a user writes: jobs, the steps inside them,
//! the units those steps run and the executors the jobs are bound to. It is
//! loaded from JSON or assembled with the builder methods and is never
//! mutated by compilation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::errors::PipewrightError;
use crate::executor::ExecutorKind;
use crate::retry::RetryPolicy;

/// Name of the executor jobs use when they do not name one.
pub const DEFAULT_EXECUTOR: &str = "default";

/// A complete workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Workflow name.
    pub name: String,

    /// Jobs by name.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,

    /// Runnable units by name.
    #[serde(default)]
    pub units: BTreeMap<String, UnitSpec>,

    /// Executors by name.
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorSpec>,

    /// Workflow-wide environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Default retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Default per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WorkflowSpec {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses a workflow from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, PipewrightError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a workflow file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipewrightError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Adds a job.
    #[must_use]
    pub fn job(mut self, name: impl Into<String>, job: JobSpec) -> Self {
        self.jobs.insert(name.into(), job);
        self
    }

    /// Adds a unit.
    #[must_use]
    pub fn unit(mut self, name: impl Into<String>, unit: UnitSpec) -> Self {
        self.units.insert(name.into(), unit);
        self
    }

    /// Adds an executor.
    #[must_use]
    pub fn executor(mut self, name: impl Into<String>, executor: ExecutorSpec) -> Self {
        self.executors.insert(name.into(), executor);
        self
    }

    /// Sets a workflow-wide environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// One job in a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Executor name; defaults to [`DEFAULT_EXECUTOR`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,

    /// Steps, run in order.
    #[serde(default)]
    pub steps: Vec<StepSpec>,

    /// Jobs that must reach a terminal state first.
    #[serde(default)]
    pub needs: BTreeSet<String>,

    /// Run condition; defaults to `success()`.
    #[serde(default, alias = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Keeps a failure of this job from halting the run.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Job environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Environment providers, applied in order.
    #[serde(default)]
    pub env_providers: Vec<String>,

    /// Artifacts restored before the steps run.
    #[serde(default)]
    pub inputs: Vec<ArtifactInput>,

    /// Artifacts saved after the steps succeed.
    #[serde(default)]
    pub outputs: BTreeMap<String, ArtifactPaths>,

    /// Retry policy for every step of the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Per-attempt timeout for every step of the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl JobSpec {
    /// Creates an empty job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the job to an executor.
    #[must_use]
    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = Some(name.into());
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds dependencies.
    #[must_use]
    pub fn needs(mut self, jobs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.needs.extend(jobs.into_iter().map(Into::into));
        self
    }

    /// Sets the run condition.
    #[must_use]
    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    /// Sets `continue_on_error`.
    #[must_use]
    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    /// Sets a job environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Appends an environment provider.
    #[must_use]
    pub fn env_provider(mut self, name: impl Into<String>) -> Self {
        self.env_providers.push(name.into());
        self
    }

    /// Restores an artifact at the job root.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(ArtifactInput::new(name));
        self
    }

    /// Restores an artifact under `path` in the job directory.
    #[must_use]
    pub fn input_at(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.inputs.push(ArtifactInput::new(name).at(path));
        self
    }

    /// Saves `path` as an artifact.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs
            .insert(name.into(), ArtifactPaths::Single(path.into()));
        self
    }

    /// Sets the job retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the job per-attempt timeout.
    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// One step in a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the job.
    pub name: String,

    /// The unit the step runs.
    pub unit: String,

    /// Run condition; defaults to `success()`.
    #[serde(default, alias = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Keeps a failure of this step from aborting the job.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Step environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Step retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Step per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepSpec {
    /// Creates a step running `unit`.
    #[must_use]
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            ..Self::default()
        }
    }

    /// Sets the run condition.
    #[must_use]
    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    /// Sets `continue_on_error`.
    #[must_use]
    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    /// Sets a step environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the step retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the step per-attempt timeout.
    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// An opaque runnable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSpec {
    /// A shell script body, run with `sh`.
    Script(String),
    /// A program run directly.
    Program {
        /// Path or name of the program.
        path: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
    },
}

impl UnitSpec {
    /// Creates a script unit.
    #[must_use]
    pub fn script(body: impl Into<String>) -> Self {
        Self::Script(body.into())
    }

    /// Creates a program unit.
    #[must_use]
    pub fn program(
        path: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::Program {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// An executor declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Backend kind.
    #[serde(default)]
    pub kind: ExecutorKind,

    /// Backend-specific options.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl ExecutorSpec {
    /// Creates a spec of the given kind.
    #[must_use]
    pub fn new(kind: ExecutorKind) -> Self {
        Self {
            kind,
            options: serde_json::Value::Null,
        }
    }

    /// Creates a bare-process executor spec.
    #[must_use]
    pub fn bare() -> Self {
        Self::new(ExecutorKind::Bare)
    }

    /// Sets backend options.
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// An artifact a job restores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ArtifactInputRepr")]
pub struct ArtifactInput {
    /// Artifact name.
    pub name: String,
    /// Directory under the job root to restore into; the root if `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ArtifactInput {
    /// Restores `name` at the job root.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    /// Restores under `path` instead.
    #[must_use]
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactInputRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        path: Option<String>,
    },
}

impl From<ArtifactInputRepr> for ArtifactInput {
    fn from(repr: ArtifactInputRepr) -> Self {
        match repr {
            ArtifactInputRepr::Name(name) => Self { name, path: None },
            ArtifactInputRepr::Full { name, path } => Self { name, path },
        }
    }
}

/// One or more paths saved under a single artifact name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactPaths {
    /// A single path.
    Single(String),
    /// Several paths.
    Multiple(Vec<String>),
}

impl ArtifactPaths {
    /// Returns the paths.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Single(p) => vec![p.as_str()],
            Self::Multiple(ps) => ps.iter().map(String::as_str).collect(),
        }
    }
}
