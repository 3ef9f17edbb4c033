//! Assertions over run reports.

use std::path::Path;
#[cfg(target_os = "linux")]
use std::time::{Duration, Instant};

use crate::artifacts::ArtifactManifest;
use crate::core::JobStatus;
use crate::scheduler::RunReport;

/// Asserts that `job` ended with `expected`.
pub fn assert_job_status(report: &RunReport, job: &str, expected: JobStatus) {
    let actual = report.status_of(job);
    assert_eq!(
        actual,
        Some(expected),
        "Expected job '{job}' to be {expected}, got {actual:?}\n{}",
        report.render_summary()
    );
}

/// Asserts the status of one step of `job`.
pub fn assert_step_status(report: &RunReport, job: &str, step: &str, expected: JobStatus) {
    let actual = report
        .job(job)
        .and_then(|j| j.steps.iter().find(|s| s.name == step))
        .map(|s| s.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected step '{job}/{step}' to be {expected}, got {actual:?}"
    );
}

/// Asserts the run's exit code.
pub fn assert_exit_code(report: &RunReport, expected: i32) {
    assert_eq!(
        report.exit_code(),
        expected,
        "Unexpected exit code\n{}",
        report.render_summary()
    );
}

/// Asserts that two directory trees hold byte-identical files.
pub fn assert_same_tree(expected: &Path, actual: &Path) {
    let left = ArtifactManifest::scan("expected", expected).unwrap();
    let right = ArtifactManifest::scan("actual", actual).unwrap();
    assert!(!left.is_empty(), "No files under {}", expected.display());
    assert!(
        left.same_content(&right),
        "Trees differ:\n{:?}\n{:?}",
        left.files,
        right.files
    );
}

/// Asserts that `pid` is gone, or left only as a zombie, within two seconds.
#[cfg(target_os = "linux")]
pub fn assert_process_gone(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while process_running(pid) {
        assert!(Instant::now() < deadline, "Process {pid} is still running");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(target_os = "linux")]
fn process_running(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state letter follows the parenthesised command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| !matches!(state, 'Z' | 'X'))
}
