//! Serve-process exit monitor.
//!
//! The monitor task is the sole owner of the serve child. It waits for
//! either the child to exit or a stop request, inside one biased
//! `select!`, so a deliberate stop can never be mistaken for a crash:
//!
//! - stop requested first → signal the child, wait out the grace period,
//!   force-kill if needed;
//! - child exited first with the stopping flag clear → move the session to
//!   `Errored` and, once the server was already `Ready`, report
//!   `AppError::UnexpectedExit` on the fatal channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::harness::spawner::drain_pumps;
use crate::models::state::SessionState;
use crate::AppError;

/// How the serve child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when terminated by a signal or unknown.
    pub code: Option<i32>,
    /// Whether the exit followed a stop request.
    pub requested: bool,
}

/// Shared handles the monitor needs from its session.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    /// Session identifier for log correlation.
    pub session_id: String,
    /// Set by the session before it requests a stop.
    pub stopping: Arc<AtomicBool>,
    /// Session lifecycle state.
    pub state: Arc<watch::Sender<SessionState>>,
    /// Channel for exits nobody is awaiting.
    pub fatal_tx: mpsc::UnboundedSender<AppError>,
    /// Time granted between the termination signal and a forced kill.
    pub stop_grace: Duration,
}

/// A running serve child and the tasks attached to it.
#[derive(Debug)]
pub struct ServeProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
    monitor: JoinHandle<ExitOutcome>,
    pumps: Vec<JoinHandle<()>>,
    stop_grace: Duration,
}

impl ServeProcess {
    /// Hand `child` to a new monitor task.
    #[must_use]
    pub fn monitor(child: Child, pumps: Vec<JoinHandle<()>>, ctx: MonitorContext) -> Self {
        let pid = child.id();
        let cancel = CancellationToken::new();
        let stop_grace = ctx.stop_grace;
        let monitor = spawn_exit_monitor(child, ctx, cancel.clone());
        Self {
            pid,
            cancel,
            monitor,
            pumps,
            stop_grace,
        }
    }

    /// OS process id at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has exited and the monitor finished.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.monitor.is_finished()
    }

    /// Monitor task handle; resolves once the child has exited.
    pub fn exit_mut(&mut self) -> &mut JoinHandle<ExitOutcome> {
        &mut self.monitor
    }

    /// Request termination and wait for the child and its pumps.
    ///
    /// The caller must raise the stopping flag first.
    pub async fn shutdown(self) -> ExitOutcome {
        self.cancel.cancel();
        let outcome = match self.monitor.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "exit monitor task failed");
                ExitOutcome {
                    code: None,
                    requested: true,
                }
            }
        };
        drain_pumps(self.pumps, self.stop_grace).await;
        outcome
    }

    /// Ask the monitor to terminate the child without waiting for it.
    ///
    /// The caller must raise the stopping flag first.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Release a child whose exit was already observed through
    /// [`exit_mut`](Self::exit_mut), letting its pumps finish.
    pub async fn reap(self) {
        drain_pumps(self.pumps, self.stop_grace).await;
    }
}

/// Spawn the task that owns `child` until it exits.
fn spawn_exit_monitor(
    mut child: Child,
    ctx: MonitorContext,
    cancel: CancellationToken,
) -> JoinHandle<ExitOutcome> {
    tokio::spawn(async move {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                let code = terminate(&mut child, ctx.stop_grace, &ctx.session_id).await;
                info!(session_id = ctx.session_id, ?code, "server stopped");
                ExitOutcome { code, requested: true }
            }

            result = child.wait() => {
                let code = match result {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!(session_id = ctx.session_id, %err, "error waiting for server process");
                        None
                    }
                };

                if ctx.stopping.load(Ordering::SeqCst) {
                    info!(session_id = ctx.session_id, ?code, "server exited during stop");
                    return ExitOutcome { code, requested: true };
                }

                error!(session_id = ctx.session_id, ?code, "server exited unexpectedly");
                let prior = ctx.state.send_replace(SessionState::Errored);
                if prior == SessionState::Ready
                    && ctx.fatal_tx.send(AppError::UnexpectedExit(code)).is_err()
                {
                    warn!(
                        session_id = ctx.session_id,
                        "fatal channel closed before unexpected exit could be delivered"
                    );
                }
                ExitOutcome { code, requested: false }
            }
        }
    })
}

/// Signal `child` to terminate, force-killing it after `grace`.
async fn terminate(child: &mut Child, grace: Duration, session_id: &str) -> Option<i32> {
    if !send_terminate(child, session_id) {
        if let Err(err) = child.start_kill() {
            warn!(session_id, %err, "failed to kill server process");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            warn!(session_id, %err, "error waiting for server process");
            None
        }
        Err(_elapsed) => {
            warn!(session_id, ?grace, "server ignored termination signal, killing");
            if let Err(err) = child.kill().await {
                warn!(session_id, %err, "failed to kill server process");
                return None;
            }
            child.wait().await.ok().and_then(|status| status.code())
        }
    }
}

/// Send `SIGTERM`. Returns `false` when the signal could not be sent.
#[cfg(unix)]
fn send_terminate(child: &Child, session_id: &str) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!(session_id, %err, "failed to send SIGTERM to server process");
            false
        }
    }
}

/// No graceful signal off unix; the caller falls back to a kill.
#[cfg(not(unix))]
fn send_terminate(_child: &Child, _session_id: &str) -> bool {
    false
}
