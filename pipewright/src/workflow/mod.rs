//! Workflow documents, dependency graph and compilation.

mod compiler;
mod env;
mod graph;
mod spec;

pub use compiler::{
    is_valid_name, CompiledJob, CompiledStep, CompiledWorkflow, Compiler, ExecutorBinding,
};
pub use env::{
    merge_layers, resolve_job_env, EnvProvider, EnvProviderRegistry, HostEnvProvider, JobEnv,
    StaticEnvProvider, ENV_ATTEMPT, ENV_JOB, ENV_JOB_DIR, ENV_RUN_ID, ENV_STEP, ENV_WORKFLOW,
};
pub use graph::JobGraph;
pub use spec::{
    ArtifactInput, ArtifactPaths, ExecutorSpec, JobSpec, StepSpec, UnitSpec, WorkflowSpec,
    DEFAULT_EXECUTOR,
};
