//! Test support for scheduler and executor tests.
//!
//! - a recording executor wraps the bare backend and logs every hook call
//! - [`TestRun`] wires a scheduler to a temp directory and a collecting sink
//! - workflow fixtures for the common scenarios

mod assertions;
mod fixtures;
mod mocks;

#[cfg(target_os = "linux")]
pub use assertions::assert_process_gone;
pub use assertions::{assert_exit_code, assert_job_status, assert_same_tree, assert_step_status};
pub use fixtures::{
    failing_unit, ok_unit, scenario_artifacts, scenario_levels, scenario_notify, single_step_job,
    TestRun,
};
pub use mocks::Hook;
