//! Workflow compilation.
//!
//! Compiling validates a [`WorkflowSpec`], computes its levels and resolves
//! per-step settings, producing a [`CompiledWorkflow`] the scheduler runs
//! without going back to the [`WorkflowSpec`].

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::env::{merge_layers, EnvProvider, EnvProviderRegistry};
use super::graph::JobGraph;
use super::spec::{ArtifactInput, ExecutorSpec, JobSpec, UnitSpec, WorkflowSpec, DEFAULT_EXECUTOR};
use crate::artifacts::validate_relative_path;
use crate::condition::Condition;
use crate::errors::CompileError;
use crate::executor::{ExecutorFactory, ExecutorKind, ExecutorRegistry};
use crate::retry::RetryPolicy;

#[allow(clippy::expect_used)]
static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("name pattern is valid")
});

/// Whether `name` is usable for a job, unit, executor or artifact.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

fn check_name(kind: &'static str, name: &str) -> Result<(), CompileError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(CompileError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// A step with every override resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    /// Step name.
    pub name: String,
    /// Unit name.
    pub unit: String,
    /// Raw condition; parsed when the step is reached.
    pub condition: Option<String>,
    /// Whether a failure of this step lets the job continue.
    pub continue_on_error: bool,
    /// Step environment layer.
    pub env: BTreeMap<String, String>,
    /// Resolved retry policy (step, then job, then workflow).
    pub retry: Option<RetryPolicy>,
    /// Resolved per-attempt timeout (step, then job, then workflow).
    pub timeout: Option<Duration>,
}

/// A job ready to dispatch.
#[derive(Debug, Clone)]
pub struct CompiledJob {
    /// Job name.
    pub name: String,
    /// Executor identity.
    pub executor: String,
    /// Execution level.
    pub level: usize,
    /// Direct dependencies.
    pub needs: BTreeSet<String>,
    /// Raw condition; parsed at dispatch.
    pub condition: Option<String>,
    /// Whether a failure of this job leaves the run going.
    pub continue_on_error: bool,
    /// Workflow env overlaid with job env.
    pub env: BTreeMap<String, String>,
    /// Providers applied after `env`, in order.
    pub env_providers: Vec<Arc<dyn EnvProvider>>,
    /// The units this job's steps run.
    pub units: BTreeMap<String, UnitSpec>,
    /// Steps in order.
    pub steps: Vec<CompiledStep>,
    /// Artifacts to restore.
    pub inputs: Vec<ArtifactInput>,
    /// `(artifact, path)` pairs to save.
    pub outputs: Vec<(String, String)>,
}

impl CompiledJob {
    /// Returns the parsed job condition.
    pub fn parsed_condition(&self) -> Result<Condition, crate::errors::ConditionError> {
        Condition::parse(self.condition.as_deref().unwrap_or(""))
    }
}

/// An executor identity and everything bound to it.
#[derive(Debug, Clone)]
pub struct ExecutorBinding {
    /// Executor name.
    pub name: String,
    /// Declared spec.
    pub spec: ExecutorSpec,
    /// Factory for the declared kind.
    pub factory: Arc<dyn ExecutorFactory>,
    /// Every unit any bound job runs.
    pub units: BTreeMap<String, UnitSpec>,
    /// Bound jobs.
    pub jobs: Vec<String>,
}

/// The output of compilation.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Workflow name.
    pub name: String,
    /// Jobs by name.
    pub jobs: BTreeMap<String, CompiledJob>,
    /// Levels in execution order.
    pub levels: Vec<Vec<String>>,
    /// Executors actually used, by name.
    pub executors: BTreeMap<String, ExecutorBinding>,
}

impl CompiledWorkflow {
    /// Returns a job.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<&CompiledJob> {
        self.jobs.get(name)
    }
}

/// Compiles workflows against a set of executor backends and env providers.
#[derive(Debug, Clone)]
pub struct Compiler {
    executors: ExecutorRegistry,
    env_providers: EnvProviderRegistry,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    /// Creates a compiler with the bare backend and the `host` provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            executors: ExecutorRegistry::with_defaults(),
            env_providers: EnvProviderRegistry::with_defaults(),
        }
    }

    /// Registers an executor factory.
    #[must_use]
    pub fn with_executor_factory(
        mut self,
        kind: ExecutorKind,
        factory: Arc<dyn ExecutorFactory>,
    ) -> Self {
        self.executors.register(kind, factory);
        self
    }

    /// Registers an environment provider.
    #[must_use]
    pub fn with_env_provider(mut self, provider: Arc<dyn EnvProvider>) -> Self {
        self.env_providers.register(provider);
        self
    }

    /// Compiles `spec`.
    ///
    /// # Errors
    ///
    /// Any structural problem: empty workflow, bad names, unknown
    /// references, dependency cycles, artifact misuse or malformed retry
    /// policies. No partial result is produced.
    pub fn compile(&self, spec: &WorkflowSpec) -> Result<CompiledWorkflow, CompileError> {
        if spec.name.trim().is_empty() {
            return Err(CompileError::Invalid("workflow name cannot be empty".to_string()));
        }
        if spec.jobs.is_empty() {
            return Err(CompileError::Invalid(format!(
                "workflow '{}' defines no jobs",
                spec.name
            )));
        }

        for name in spec.jobs.keys() {
            check_name("job", name)?;
        }
        for name in spec.units.keys() {
            check_name("unit", name)?;
        }
        for name in spec.executors.keys() {
            check_name("executor", name)?;
        }
        if let Some(policy) = &spec.retry {
            policy.validate("workflow")?;
        }

        let graph = JobGraph::from_jobs(&spec.jobs)?;
        let producers = collect_producers(spec)?;

        let mut jobs = BTreeMap::new();
        let mut executors: BTreeMap<String, ExecutorBinding> = BTreeMap::new();

        for (name, job) in &spec.jobs {
            let compiled = self.compile_job(spec, &graph, &producers, name, job)?;

            if !executors.contains_key(&compiled.executor) {
                let binding = self.bind_executor(spec, name, &compiled.executor)?;
                executors.insert(compiled.executor.clone(), binding);
            }
            if let Some(binding) = executors.get_mut(&compiled.executor) {
                binding.jobs.push(name.clone());
                binding
                    .units
                    .extend(compiled.units.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            jobs.insert(name.clone(), compiled);
        }

        debug!(
            workflow = %spec.name,
            jobs = jobs.len(),
            levels = graph.levels().len(),
            executors = executors.len(),
            "Compiled workflow"
        );

        Ok(CompiledWorkflow {
            name: spec.name.clone(),
            jobs,
            levels: graph.levels().to_vec(),
            executors,
        })
    }

    fn bind_executor(
        &self,
        spec: &WorkflowSpec,
        job: &str,
        executor: &str,
    ) -> Result<ExecutorBinding, CompileError> {
        let executor_spec = match spec.executors.get(executor) {
            Some(s) => s.clone(),
            None if executor == DEFAULT_EXECUTOR => ExecutorSpec::bare(),
            None => {
                return Err(CompileError::UnknownExecutor {
                    job: job.to_string(),
                    executor: executor.to_string(),
                })
            }
        };
        let factory = self.executors.get(executor_spec.kind).ok_or_else(|| {
            CompileError::UnsupportedExecutor {
                executor: executor.to_string(),
                kind: executor_spec.kind.to_string(),
            }
        })?;

        Ok(ExecutorBinding {
            name: executor.to_string(),
            spec: executor_spec,
            factory,
            units: BTreeMap::new(),
            jobs: Vec::new(),
        })
    }

    fn compile_job(
        &self,
        spec: &WorkflowSpec,
        graph: &JobGraph,
        producers: &BTreeMap<String, String>,
        name: &str,
        job: &JobSpec,
    ) -> Result<CompiledJob, CompileError> {
        if let Some(policy) = &job.retry {
            policy.validate(&format!("job '{name}'"))?;
        }
        if let Some(expr) = &job.condition {
            if let Err(e) = Condition::parse(expr) {
                warn!(
                    job = name,
                    error = %e,
                    "Job condition does not parse; the job will fail when dispatched"
                );
            }
        }

        let mut env_providers = Vec::with_capacity(job.env_providers.len());
        for provider in &job.env_providers {
            env_providers.push(self.env_providers.get(provider).ok_or_else(|| {
                CompileError::UnknownEnvProvider {
                    job: name.to_string(),
                    provider: provider.clone(),
                }
            })?);
        }

        let mut seen = BTreeSet::new();
        let mut units = BTreeMap::new();
        let mut steps = Vec::with_capacity(job.steps.len());
        for step in &job.steps {
            check_name("step", &step.name)?;
            if !seen.insert(step.name.as_str()) {
                return Err(CompileError::DuplicateStep {
                    job: name.to_string(),
                    step: step.name.clone(),
                });
            }
            let unit = spec.units.get(&step.unit).ok_or_else(|| CompileError::UnknownUnit {
                job: name.to_string(),
                step: step.name.clone(),
                unit: step.unit.clone(),
            })?;
            units.insert(step.unit.clone(), unit.clone());

            if let Some(policy) = &step.retry {
                policy.validate(&format!("step '{}' of job '{name}'", step.name))?;
            }

            let timeout_secs = step.timeout_secs.or(job.timeout_secs).or(spec.timeout_secs);
            steps.push(CompiledStep {
                name: step.name.clone(),
                unit: step.unit.clone(),
                condition: step.condition.clone(),
                continue_on_error: step.continue_on_error,
                env: step.env.clone(),
                retry: RetryPolicy::resolve(
                    step.retry.as_ref(),
                    job.retry.as_ref(),
                    spec.retry.as_ref(),
                ),
                timeout: timeout_secs.map(Duration::from_secs),
            });
        }

        let ancestors = graph.ancestors(name);
        for input in &job.inputs {
            let producer = producers.get(&input.name).ok_or_else(|| CompileError::UnknownArtifact {
                job: name.to_string(),
                artifact: input.name.clone(),
            })?;
            if !ancestors.contains(producer) {
                return Err(CompileError::ArtifactNotUpstream {
                    job: name.to_string(),
                    artifact: input.name.clone(),
                    producer: producer.clone(),
                });
            }
            if let Some(path) = &input.path {
                check_artifact_path(name, &input.name, path)?;
            }
        }

        let mut outputs = Vec::new();
        for (artifact, paths) in &job.outputs {
            for path in paths.paths() {
                check_artifact_path(name, artifact, path)?;
                outputs.push((artifact.clone(), path.to_string()));
            }
        }

        Ok(CompiledJob {
            name: name.to_string(),
            executor: job
                .executor
                .clone()
                .unwrap_or_else(|| DEFAULT_EXECUTOR.to_string()),
            level: graph.level_of(name).unwrap_or(0),
            needs: job.needs.clone(),
            condition: job.condition.clone(),
            continue_on_error: job.continue_on_error,
            env: merge_layers([&spec.env, &job.env]),
            env_providers,
            units,
            steps,
            inputs: job.inputs.clone(),
            outputs,
        })
    }
}

/// Maps each output artifact to the single job producing it.
fn collect_producers(spec: &WorkflowSpec) -> Result<BTreeMap<String, String>, CompileError> {
    let mut producers: BTreeMap<String, String> = BTreeMap::new();
    for (job, spec_job) in &spec.jobs {
        for artifact in spec_job.outputs.keys() {
            check_name("artifact", artifact)?;
            if let Some(first) = producers.get(artifact) {
                return Err(CompileError::DuplicateArtifact {
                    artifact: artifact.clone(),
                    first: first.clone(),
                    second: job.clone(),
                });
            }
            producers.insert(artifact.clone(), job.clone());
        }
    }
    Ok(producers)
}

fn check_artifact_path(job: &str, artifact: &str, path: &str) -> Result<(), CompileError> {
    validate_relative_path(path)
        .map(|_| ())
        .map_err(|_| CompileError::InvalidArtifactPath {
            job: job.to_string(),
            artifact: artifact.to_string(),
            path: path.to_string(),
        })
}
