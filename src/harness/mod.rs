//! Build-then-serve process lifecycle harness.
//!
//! A [`Harness`] is one session: it runs the framework's finite build
//! sub-run, reads the build identifier it wrote, then launches the
//! long-running server and waits until the server prints its URL.
//!
//! Submodules:
//! - `output`: stream pumps, the bounded output log, and output events.
//! - `readiness`: readiness marker parsing and the one-shot watcher.
//! - `spawner`: process specs and spawning with captured stdio.
//! - `monitor`: serve-process exit monitoring and termination.

pub mod monitor;
pub mod output;
pub mod readiness;
pub mod spawner;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::config::{HarnessConfig, BUILD_ID_FILE};
use crate::models::ready::ReadyInfo;
use crate::models::state::SessionState;
use crate::{AppError, Result};

use self::monitor::{ExitOutcome, MonitorContext, ServeProcess};
use self::output::{OutputEvent, OutputLog, OutputSink, SharedOutputLog, EVENT_CHANNEL_CAPACITY};
use self::readiness::ReadinessWatcher;
use self::spawner::{drain_pumps, spawn_captured, ProcessSpec};

/// Read `<dist_dir>/BUILD_ID` and return its trimmed contents.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be read.
pub async fn read_build_id(dist_dir: &Path) -> Result<String> {
    let path = dist_dir.join(BUILD_ID_FILE);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", path.display())))?;
    Ok(raw.trim().to_owned())
}

/// How the readiness wait ended.
enum Readiness {
    Announced(Result<Url>),
    StreamClosed,
    Exited(ExitOutcome),
}

/// One managed build-then-serve session.
///
/// At most one child process is alive per harness. Dropping the harness
/// stops the server in the background.
#[derive(Debug)]
pub struct Harness {
    id: String,
    config: HarnessConfig,
    log: SharedOutputLog,
    events: broadcast::Sender<OutputEvent>,
    state: Arc<watch::Sender<SessionState>>,
    stopping: Arc<AtomicBool>,
    process: Option<ServeProcess>,
    url: Option<Url>,
    build_id: Option<String>,
    last_exit_code: Option<i32>,
    fatal_tx: mpsc::UnboundedSender<AppError>,
    fatal_rx: Option<mpsc::UnboundedReceiver<AppError>>,
}

impl Harness {
    /// Create an idle harness for `config`.
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SessionState::Idle);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4().to_string(),
            log: Arc::new(Mutex::new(OutputLog::new(config.max_output_bytes))),
            config,
            events,
            state: Arc::new(state),
            stopping: Arc::new(AtomicBool::new(false)),
            process: None,
            url: None,
            build_id: None,
            last_exit_code: None,
            fatal_tx,
            fatal_rx: Some(fatal_rx),
        }
    }

    /// Session identifier attached to every log line of this harness.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration the harness was created with.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver observing every lifecycle transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// URL announced by the running server, once ready.
    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Build identifier read after the last successful build.
    #[must_use]
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    /// Exit code of the most recently exited child.
    #[must_use]
    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    /// Whether a stop has been requested for the current server.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Whether a server process is held and has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().has_live_process()
            && self
                .process
                .as_ref()
                .is_some_and(|process| !process.has_exited())
    }

    /// OS process id of the running server.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ServeProcess::pid)
    }

    /// Subscribe to output chunks from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.events.subscribe()
    }

    /// Take the receiver of unexpected server exits.
    ///
    /// Exits after readiness have no caller waiting on them; they are
    /// delivered here and always logged at `error`. Returns `None` after
    /// the first call.
    pub fn take_fatal_errors(&mut self) -> Option<mpsc::UnboundedReceiver<AppError>> {
        self.fatal_rx.take()
    }

    /// Everything the children printed so far, stdout and stderr combined.
    pub async fn cli_output(&self) -> String {
        self.log.lock().await.text()
    }

    /// Raw bytes of the accumulated output.
    pub async fn output_bytes(&self) -> Vec<u8> {
        self.log.lock().await.as_bytes().to_vec()
    }

    /// Whether the output log hit its bound and dropped output.
    pub async fn output_truncated(&self) -> bool {
        self.log.lock().await.is_truncated()
    }

    /// Run the whole lifecycle: build, read the build id, serve, and wait
    /// for the server to announce its URL.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyStarted`: a server is still running.
    /// - `AppError::BuildFailed`: the build exited non-zero.
    /// - `AppError::Io`: the build identifier could not be read.
    /// - Any error of [`start_serve_step`](Self::start_serve_step).
    pub async fn start(&mut self) -> Result<ReadyInfo> {
        self.release_exited_server().await?;

        let build = ProcessSpec::build(&self.config);
        self.run_build_step(&build).await?;

        let build_id = match self.read_build_id().await {
            Ok(build_id) => build_id,
            Err(err) => {
                self.state.send_replace(SessionState::Errored);
                return Err(err);
            }
        };
        self.build_id = Some(build_id.clone());

        let serve = ProcessSpec::serve(&self.config);
        let url = self.start_serve_step(&serve).await?;

        Ok(ReadyInfo {
            session_id: self.id.clone(),
            url,
            build_id,
            ready_at: Utc::now(),
        })
    }

    /// Run a finite sub-run to completion, relaying its output.
    ///
    /// Returns the exit code. Output is kept in the log whatever the outcome.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyStarted`: a server is still running.
    /// - `AppError::InvalidTransition`: the session is mid-lifecycle.
    /// - `AppError::Spawn`: the process could not be spawned.
    /// - `AppError::BuildFailed(code)`: the process exited non-zero.
    pub async fn run_build_step(&mut self, spec: &ProcessSpec) -> Result<i32> {
        self.release_exited_server().await?;
        self.ensure_transition(SessionState::Building)?;

        let span = info_span!("build_step", session_id = self.id, command = %spec.display());
        self.url = None;
        self.build_id = None;
        self.state.send_replace(SessionState::Building);

        let captured = match spawn_captured(spec, &self.sink(), None) {
            Ok(captured) => captured,
            Err(err) => {
                self.state.send_replace(SessionState::Errored);
                return Err(err);
            }
        };
        let mut child = captured.child;

        let status = child.wait().instrument(span.clone()).await;
        drain_pumps(captured.pumps, self.config.timeouts.stop_grace())
            .instrument(span.clone())
            .await;
        let _guard = span.enter();

        let code = match status {
            // A signal-terminated build reports no code.
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                self.state.send_replace(SessionState::Errored);
                return Err(AppError::Io(format!("failed to wait for build: {err}")));
            }
        };
        self.last_exit_code = Some(code);

        if code != 0 {
            warn!(code, "build failed");
            self.state.send_replace(SessionState::Errored);
            return Err(AppError::BuildFailed(code));
        }

        info!("build finished");
        self.state.send_replace(SessionState::Built);
        Ok(code)
    }

    /// Read the build identifier from the configured dist directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read.
    pub async fn read_build_id(&self) -> Result<String> {
        read_build_id(&self.config.dist_path()).await
    }

    /// Launch the long-running server and wait for its readiness marker.
    ///
    /// On success the server keeps running under an exit monitor; an exit
    /// without [`stop`](Self::stop) is reported through
    /// [`take_fatal_errors`](Self::take_fatal_errors).
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyStarted`: a server is still running.
    /// - `AppError::InvalidTransition`: no successful build precedes it.
    /// - `AppError::Spawn`: the process could not be spawned.
    /// - `AppError::UnexpectedExit`: the server exited before readiness.
    /// - `AppError::InvalidUrl`: the announced URL did not parse.
    /// - `AppError::ReadyTimeout`: no marker within the configured timeout.
    pub async fn start_serve_step(&mut self, spec: &ProcessSpec) -> Result<Url> {
        self.release_exited_server().await?;
        self.ensure_transition(SessionState::Starting)?;

        let span = info_span!("serve_step", session_id = self.id, command = %spec.display());
        self.stopping.store(false, Ordering::SeqCst);

        let (watcher, ready_rx) = ReadinessWatcher::new();
        let captured = match spawn_captured(spec, &self.sink(), Some(watcher)) {
            Ok(captured) => captured,
            Err(err) => {
                self.state.send_replace(SessionState::Errored);
                return Err(err);
            }
        };
        self.state.send_replace(SessionState::Starting);
        self.process = Some(ServeProcess::monitor(
            captured.child,
            captured.pumps,
            self.monitor_context(),
        ));

        let waited = self.await_ready(ready_rx).instrument(span.clone()).await;
        match waited {
            Ok(Readiness::Announced(Ok(url))) => {
                let promoted = self.state.send_if_modified(|state| {
                    if *state == SessionState::Starting {
                        *state = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    span.in_scope(|| info!(%url, "server ready"));
                    self.url = Some(url.clone());
                    return Ok(url);
                }
                // The server died right after announcing itself.
                let code = self.reap_exited().await;
                Err(AppError::UnexpectedExit(code))
            }
            Ok(Readiness::Announced(Err(err))) => {
                self.abort_serve().instrument(span).await;
                Err(err)
            }
            Ok(Readiness::StreamClosed) => {
                // Stdout closed without a marker; the server is of no use.
                let code = self.abort_serve().instrument(span).await;
                Err(AppError::UnexpectedExit(code))
            }
            Ok(Readiness::Exited(outcome)) => {
                if let Some(process) = self.process.take() {
                    process.reap().await;
                }
                self.last_exit_code = outcome.code;
                Err(AppError::UnexpectedExit(outcome.code))
            }
            Err(err) => {
                self.abort_serve().instrument(span).await;
                Err(err)
            }
        }
    }

    /// Stop the running server.
    ///
    /// Raises the stopping flag before signalling, so the resulting exit is
    /// never reported as a crash. Returns the server's exit code; calling it
    /// with no server running is a no-op returning `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for termination
    /// failures that must reach the caller.
    pub async fn stop(&mut self) -> Result<Option<i32>> {
        let Some(process) = self.process.take() else {
            debug!(session_id = self.id, "stop requested with no server running");
            return Ok(None);
        };

        let span = info_span!("stop", session_id = self.id, pid = process.pid());
        self.stopping.store(true, Ordering::SeqCst);
        let outcome = process.shutdown().instrument(span).await;
        self.last_exit_code = outcome.code;

        if outcome.requested {
            self.state.send_if_modified(|state| {
                if matches!(state, SessionState::Starting | SessionState::Ready) {
                    *state = SessionState::Stopped;
                    true
                } else {
                    false
                }
            });
        }
        Ok(outcome.code)
    }

    async fn await_ready(
        &mut self,
        ready_rx: oneshot::Receiver<Result<Url>>,
    ) -> Result<Readiness> {
        let limit = self.config.timeouts.ready_timeout();
        let process = self.process.as_mut().ok_or(AppError::NotRunning)?;

        let wait = async {
            tokio::select! {
                announced = ready_rx => match announced {
                    Ok(result) => Readiness::Announced(result),
                    Err(_) => Readiness::StreamClosed,
                },
                joined = process.exit_mut() => match joined {
                    Ok(outcome) => Readiness::Exited(outcome),
                    Err(err) => {
                        warn!(%err, "exit monitor task failed");
                        Readiness::Exited(ExitOutcome { code: None, requested: false })
                    }
                },
            }
        };

        match limit {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AppError::ReadyTimeout(limit)),
            None => Ok(wait.await),
        }
    }

    /// Collect the exit of a server whose stdout already closed or whose
    /// state was flipped to `Errored` by the monitor.
    async fn reap_exited(&mut self) -> Option<i32> {
        let mut process = self.process.take()?;
        let code = match process.exit_mut().await {
            Ok(outcome) => outcome.code,
            Err(err) => {
                warn!(%err, "exit monitor task failed");
                None
            }
        };
        process.reap().await;
        self.state.send_replace(SessionState::Errored);
        self.last_exit_code = code;
        code
    }

    /// Terminate a server that failed to become ready.
    async fn abort_serve(&mut self) -> Option<i32> {
        let mut code = None;
        if let Some(process) = self.process.take() {
            self.stopping.store(true, Ordering::SeqCst);
            code = process.shutdown().await.code;
            self.last_exit_code = code;
        }
        self.state.send_replace(SessionState::Errored);
        code
    }

    /// Fail with `AlreadyStarted` while a server is alive; release the
    /// handle of one that already exited.
    async fn release_exited_server(&mut self) -> Result<()> {
        match self.process.take() {
            None => Ok(()),
            Some(process) if process.has_exited() => {
                process.reap().await;
                Ok(())
            }
            Some(process) => {
                self.process = Some(process);
                Err(AppError::AlreadyStarted)
            }
        }
    }

    fn ensure_transition(&self, next: SessionState) -> Result<()> {
        let current = self.state();
        if current.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition(format!(
                "cannot move from {current:?} to {next:?}"
            )))
        }
    }

    fn sink(&self) -> OutputSink {
        OutputSink::new(
            self.id.clone(),
            Arc::clone(&self.log),
            self.events.clone(),
            self.config.echo_output,
        )
    }

    fn monitor_context(&self) -> MonitorContext {
        MonitorContext {
            session_id: self.id.clone(),
            stopping: Arc::clone(&self.stopping),
            state: Arc::clone(&self.state),
            fatal_tx: self.fatal_tx.clone(),
            stop_grace: self.config.timeouts.stop_grace(),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            self.stopping.store(true, Ordering::SeqCst);
            process.request_stop();
        }
    }
}
