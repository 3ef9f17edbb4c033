//! Environment providers and variable precedence.
//!
//! Lowest to highest: workflow `env`, job `env`, job env providers in
//! declared order, step `env`, then the `PIPEWRIGHT_*` built-ins.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use crate::errors::EnvError;

/// Run identifier.
pub const ENV_RUN_ID: &str = "PIPEWRIGHT_RUN_ID";
/// Workflow name.
pub const ENV_WORKFLOW: &str = "PIPEWRIGHT_WORKFLOW";
/// Job name.
pub const ENV_JOB: &str = "PIPEWRIGHT_JOB";
/// Step name.
pub const ENV_STEP: &str = "PIPEWRIGHT_STEP";
/// The job's working directory.
pub const ENV_JOB_DIR: &str = "PIPEWRIGHT_JOB_DIR";
/// The 1-indexed attempt number of the running step.
pub const ENV_ATTEMPT: &str = "PIPEWRIGHT_ATTEMPT";

/// Supplies extra environment variables to a job at dispatch time.
#[async_trait]
pub trait EnvProvider: Send + Sync + Debug {
    /// The name jobs refer to this provider by.
    fn name(&self) -> &str;

    /// Returns variables for `job`.
    async fn provide(&self, job: &str) -> Result<BTreeMap<String, String>, EnvError>;
}

/// Passes selected host variables through.
#[derive(Debug, Clone)]
pub struct HostEnvProvider {
    vars: Vec<String>,
}

impl Default for HostEnvProvider {
    fn default() -> Self {
        Self::new(["PATH", "HOME", "USER", "LANG", "TMPDIR", "CI"])
    }
}

impl HostEnvProvider {
    /// Passes through exactly `vars`, skipping unset ones.
    #[must_use]
    pub fn new(vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            vars: vars.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl EnvProvider for HostEnvProvider {
    fn name(&self) -> &str {
        "host"
    }

    async fn provide(&self, _job: &str) -> Result<BTreeMap<String, String>, EnvError> {
        Ok(self
            .vars
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.clone(), v)))
            .collect())
    }
}

/// A provider returning a fixed map.
#[derive(Debug, Clone)]
pub struct StaticEnvProvider {
    name: String,
    vars: BTreeMap<String, String>,
}

impl StaticEnvProvider {
    /// Creates a provider named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, vars: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            vars,
        }
    }
}

#[async_trait]
impl EnvProvider for StaticEnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provide(&self, _job: &str) -> Result<BTreeMap<String, String>, EnvError> {
        Ok(self.vars.clone())
    }
}

/// Providers available to a compiler, by name.
#[derive(Debug, Clone, Default)]
pub struct EnvProviderRegistry {
    providers: BTreeMap<String, Arc<dyn EnvProvider>>,
}

impl EnvProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the `host` provider.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HostEnvProvider::default()));
        registry
    }

    /// Registers a provider, replacing any with the same name.
    pub fn register(&mut self, provider: Arc<dyn EnvProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Looks up a provider.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn EnvProvider>> {
        self.providers.get(name).cloned()
    }
}

/// Overlays `layers` in order; later layers win.
#[must_use]
pub fn merge_layers<'a>(
    layers: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// The resolved environment of one dispatched job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobEnv {
    base: BTreeMap<String, String>,
    builtins: BTreeMap<String, String>,
}

impl JobEnv {
    /// Creates a job environment from its user-defined layers.
    #[must_use]
    pub fn new(base: BTreeMap<String, String>, run_id: &str, workflow: &str, job: &str) -> Self {
        let builtins = [
            (ENV_RUN_ID, run_id),
            (ENV_WORKFLOW, workflow),
            (ENV_JOB, job),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { base, builtins }
    }

    /// Records the job's working directory.
    pub fn set_job_dir(&mut self, dir: &Path) {
        self.builtins
            .insert(ENV_JOB_DIR.to_string(), dir.display().to_string());
    }

    /// Returns the job-level environment.
    #[must_use]
    pub fn vars(&self) -> BTreeMap<String, String> {
        merge_layers([&self.base, &self.builtins])
    }

    /// Returns the environment for one attempt of a step.
    #[must_use]
    pub fn for_step(
        &self,
        step_env: &BTreeMap<String, String>,
        step: &str,
        attempt: u32,
    ) -> BTreeMap<String, String> {
        let mut vars = merge_layers([&self.base, step_env, &self.builtins]);
        vars.insert(ENV_STEP.to_string(), step.to_string());
        vars.insert(ENV_ATTEMPT.to_string(), attempt.to_string());
        vars
    }
}

/// Resolves a job's user-defined environment.
///
/// `static_env` is the workflow env already overlaid with the job env.
pub async fn resolve_job_env(
    static_env: &BTreeMap<String, String>,
    providers: &[Arc<dyn EnvProvider>],
    job: &str,
) -> Result<BTreeMap<String, String>, EnvError> {
    let mut env = static_env.clone();
    for provider in providers {
        env.extend(provider.provide(job).await?);
    }
    Ok(env)
}
