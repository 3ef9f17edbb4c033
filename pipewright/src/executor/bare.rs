//! The bare-process reference backend.
//!
//! Layout under `<workspace_root>/<run_id>/<executor>/`:
//!
//! ```text
//! units/<unit>.sh     script units, written once by setup_workspace
//! jobs/<job>/         one working directory per job
//! ```
//!
//! On Unix each unit runs as the leader of its own process group. The group
//! is killed when the unit is cancelled, when its future is dropped (an
//! attempt timeout) and after the leader exits, so no process a unit
//! started outlives it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{Executor, ExecutorFactory, ExecutorKind, UnitRequest, WorkspaceContext};
use crate::errors::{ExecutorError, UnitError};
use crate::workflow::{ExecutorSpec, UnitSpec};

const STDERR_TAIL_LINES: usize = 20;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs units as host child processes.
#[derive(Debug)]
pub struct BareExecutor {
    name: String,
    root: PathBuf,
    keep_workspace: bool,
    ready: AtomicBool,
    jobs: DashMap<String, PathBuf>,
}

impl BareExecutor {
    /// Creates an executor whose workspace lives under `ctx.workspace_root`.
    #[must_use]
    pub fn new(name: impl Into<String>, ctx: &WorkspaceContext) -> Self {
        let name = name.into();
        let root = ctx.workspace_root.join(&ctx.run_id).join(&name);
        Self {
            name,
            root,
            keep_workspace: ctx.keep_workspace,
            ready: AtomicBool::new(false),
            jobs: DashMap::new(),
        }
    }

    /// Returns the workspace directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn script_path(&self, unit: &str) -> PathBuf {
        self.root.join("units").join(format!("{unit}.sh"))
    }

    fn io_err(
        &self,
        operation: &'static str,
        path: &Path,
        source: std::io::Error,
    ) -> ExecutorError {
        ExecutorError::io(self.name.clone(), operation, path, source)
    }

    fn command_for(&self, request: &UnitRequest<'_>) -> Command {
        let mut cmd = match request.unit {
            UnitSpec::Script(_) => {
                let mut cmd = Command::new("sh");
                cmd.arg(self.script_path(request.unit_name));
                cmd
            }
            UnitSpec::Program { path, args } => {
                let mut cmd = Command::new(path);
                cmd.args(args);
                cmd
            }
        };
        cmd.current_dir(request.job_dir)
            .envs(request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Executor for BareExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Bare
    }

    async fn setup_workspace(
        &self,
        units: &BTreeMap<String, UnitSpec>,
    ) -> Result<(), ExecutorError> {
        if tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.root)
                .await
                .map_err(|e| self.io_err("clear workspace", &self.root, e))?;
        }

        let units_dir = self.root.join("units");
        for dir in [units_dir.clone(), self.root.join("jobs")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| self.io_err("create directory", &dir, e))?;
        }

        for (name, unit) in units {
            if let UnitSpec::Script(body) = unit {
                let path = self.script_path(name);
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| self.io_err("write unit", &path, e))?;
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(
            executor = %self.name,
            root = %self.root.display(),
            units = units.len(),
            "Workspace ready"
        );
        Ok(())
    }

    async fn cleanup_workspace(&self) -> Result<(), ExecutorError> {
        self.ready.store(false, Ordering::SeqCst);
        self.jobs.clear();
        if self.keep_workspace {
            info!(executor = %self.name, root = %self.root.display(), "Keeping workspace");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(executor = %self.name, "Workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err("remove workspace", &self.root, e)),
        }
    }

    async fn setup_job(
        &self,
        job: &str,
        _units: &BTreeMap<String, UnitSpec>,
    ) -> Result<PathBuf, ExecutorError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(ExecutorError::WorkspaceUnavailable {
                executor: self.name.clone(),
            });
        }

        let dir = self.root.join("jobs").join(job);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| self.io_err("clear job directory", &dir, e))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.io_err("create job directory", &dir, e))?;

        self.jobs.insert(job.to_string(), dir.clone());
        Ok(dir)
    }

    async fn run_unit(&self, request: UnitRequest<'_>) -> Result<(), UnitError> {
        let mut child = self
            .command_for(&request)
            .spawn()
            .map_err(|source| UnitError::Spawn {
                unit: request.unit_name.to_string(),
                source,
            })?;
        let mut group = ProcessGroup::of(&child, request.unit_name);

        let label = format!("{}/{}", request.job, request.step);
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, label.clone(), false)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, label.clone(), true)));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            () = request.cancel.cancelled() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(status) => status.map_err(|source| UnitError::Spawn {
                unit: request.unit_name.to_string(),
                source,
            })?,
            Waited::Cancelled => {
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(unit = request.unit_name, error = %e, "Failed to kill unit");
                }
                return Err(UnitError::Cancelled {
                    unit: request.unit_name.to_string(),
                });
            }
        };
        group.kill();

        if let Some(handle) = stdout {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await;
        }
        let stderr_tail = match stderr {
            Some(handle) => tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else {
            Err(UnitError::NonZeroExit {
                unit: request.unit_name.to_string(),
                exit_code: status.code(),
                stderr: stderr_tail,
            })
        }
    }

    async fn cleanup_job(&self, job: &str) -> Result<(), ExecutorError> {
        let Some((_, dir)) = self.jobs.remove(job) else {
            return Ok(());
        };
        if self.keep_workspace {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err("remove job directory", &dir, e)),
        }
    }

    fn job_dir(&self, job: &str) -> Option<PathBuf> {
        self.jobs.get(job).map(|entry| entry.value().clone())
    }
}

/// Kills a unit's process group once, at the latest when dropped.
#[cfg_attr(not(unix), allow(dead_code))]
struct ProcessGroup {
    pgid: Option<i32>,
    unit: String,
}

impl ProcessGroup {
    fn of(child: &Child, unit: &str) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
            unit: unit.to_string(),
        }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => debug!(unit = %self.unit, pgid, "Killed unit process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(
                unit = %self.unit,
                pgid,
                error = %e,
                "Failed to kill unit process group"
            ),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

/// Logs each line of `reader`; returns the last lines when `keep_tail` is set.
async fn forward_lines<R>(reader: R, label: String, keep_tail: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if keep_tail {
                    info!(target: "pipewright::unit", unit = %label, stream = "stderr", "{line}");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                } else {
                    info!(target: "pipewright::unit", unit = %label, stream = "stdout", "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(unit = %label, error = %e, "Stopped reading unit output");
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

/// Creates [`BareExecutor`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BareExecutorFactory;

impl ExecutorFactory for BareExecutorFactory {
    fn create(
        &self,
        name: &str,
        _spec: &ExecutorSpec,
        ctx: &WorkspaceContext,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        Ok(Arc::new(BareExecutor::new(name, ctx)))
    }
}
