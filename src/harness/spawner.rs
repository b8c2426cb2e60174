//! Child process spawner.
//!
//! Spawns framework CLI sub-runs with:
//! - stdin closed and stdout/stderr piped, so nothing interactive leaks in;
//! - the inherited environment extended with the configured overrides;
//! - `kill_on_drop(true)` so a dropped harness never leaks a server;
//! - one pump task per captured stream feeding the session's output sink.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::harness::output::{pump_stream, OutputSink, StreamKind};
use crate::harness::readiness::ReadinessWatcher;
use crate::{AppError, Result};

/// Everything needed to launch one sub-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program to execute.
    pub program: OsString,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Create a spec with no arguments and no environment overrides.
    #[must_use]
    pub fn new(program: impl Into<OsString>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `<runtime> <cli-entry> <build args…>` in the configured test directory.
    #[must_use]
    pub fn build(config: &HarnessConfig) -> Self {
        Self::cli_sub_run(config, &config.build_args)
    }

    /// `<runtime> <cli-entry> <start args…>` in the configured test directory.
    #[must_use]
    pub fn serve(config: &HarnessConfig) -> Self {
        Self::cli_sub_run(config, &config.start_args)
    }

    fn cli_sub_run(config: &HarnessConfig, sub_args: &[String]) -> Self {
        let mut spec = Self::new(&config.runtime, &config.test_dir)
            .arg(config.cli_entry.as_os_str())
            .args(sub_args);
        spec.env = config.env_overrides();
        spec
    }

    /// Human-readable command line for logs and error messages.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// A spawned child whose output streams are being pumped.
#[derive(Debug)]
pub struct CapturedChild {
    /// Child process handle; dropping it kills the process.
    pub child: Child,
    /// Pump tasks for stdout and stderr.
    pub pumps: Vec<JoinHandle<()>>,
}

/// Spawn `spec` and start relaying its output into `sink`.
///
/// The optional `watcher` is attached to the stdout pump only.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn …")`: OS spawn failure.
/// - `AppError::Spawn("failed to capture …")`: a piped stream was missing.
pub fn spawn_captured(
    spec: &ProcessSpec,
    sink: &OutputSink,
    watcher: Option<ReadinessWatcher>,
) -> Result<CapturedChild> {
    let mut child = spec
        .command()
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn `{}`: {err}", spec.display())))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture child stderr".into()))?;

    info!(
        pid = child.id().unwrap_or(0),
        command = %spec.display(),
        working_dir = %spec.working_dir.display(),
        "child process spawned"
    );

    let pumps = vec![
        tokio::spawn(pump_stream(stdout, StreamKind::Stdout, sink.clone(), watcher)),
        tokio::spawn(pump_stream(stderr, StreamKind::Stderr, sink.clone(), None)),
    ];

    Ok(CapturedChild { child, pumps })
}

/// Wait for pump tasks to reach EOF, aborting any still running after
/// `limit`.
///
/// A grandchild that inherited the pipes can hold them open after the
/// direct child is gone; the limit keeps that from hanging the caller.
pub async fn drain_pumps(pumps: Vec<JoinHandle<()>>, limit: Duration) {
    for mut pump in pumps {
        match tokio::time::timeout(limit, &mut pump).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "output pump task failed"),
            Err(_elapsed) => {
                warn!(?limit, "output pump still open after child exit, aborting");
                pump.abort();
            }
        }
    }
}
