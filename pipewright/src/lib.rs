//! # Pipewright
//!
//! Compiles declarative job pipelines and runs them level by level, without
//! a server or agent.
//!
//! A [`WorkflowSpec`](workflow::WorkflowSpec) names jobs, their `needs`,
//! run conditions, retry policies, artifacts and the executor each job is
//! bound to. The [`Compiler`](workflow::Compiler) validates it and computes
//! execution levels; the [`Scheduler`](scheduler::Scheduler) then:
//!
//! - **Runs levels in order**: every job of a level runs concurrently, and a
//!   level starts only once the previous one is fully terminal
//! - **Gates jobs and steps** with a small closed condition grammar
//!   (`success()`, `failure()`, `always()`, `cancelled()`, `env.NAME`)
//! - **Retries units** with exponential, linear or constant backoff
//! - **Moves artifacts** between isolated job directories through a
//!   host-side store
//! - **Tears down every executor workspace**, even on cancellation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipewright::prelude::*;
//!
//! # async fn demo() -> Result<(), PipewrightError> {
//! let spec = WorkflowSpec::new("ci")
//!     .unit("ok", UnitSpec::script("echo ok"))
//!     .job("lint", JobSpec::new().step(StepSpec::new("run", "ok")))
//!     .job("test", JobSpec::new().step(StepSpec::new("run", "ok")))
//!     .job(
//!         "build",
//!         JobSpec::new().needs(["lint", "test"]).step(StepSpec::new("run", "ok")),
//!     );
//!
//! let workflow = Compiler::new().compile(&spec)?;
//! let report = Scheduler::new(RunConfig::new()).run(&workflow).await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod condition;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod retry;
pub mod scheduler;
pub mod utils;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactManifest, ArtifactStore};
    pub use crate::cancellation::{cancel_on_interrupt, CancellationToken};
    pub use crate::condition::{Condition, ConditionContext};
    pub use crate::config::RunConfig;
    pub use crate::core::{JobStatus, RunEvent};
    pub use crate::errors::{
        ArtifactError, CompileError, ConditionError, ExecutorError, GraphError,
        PipewrightError, UnitError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{
        BareExecutor, Executor, ExecutorFactory, ExecutorKind, ExecutorRegistry,
    };
    pub use crate::retry::{Backoff, RetryPolicy};
    pub use crate::scheduler::{JobReport, RunReport, Scheduler};
    pub use crate::workflow::{
        CompiledWorkflow, Compiler, EnvProvider, JobGraph, JobSpec, StepSpec, UnitSpec,
        WorkflowSpec,
    };
}
