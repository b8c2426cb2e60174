#![forbid(unsafe_code)]

//! `serve-harness`: build and start a production server from the shell.
//!
//! Runs the framework build, starts the server, prints the URL it announced,
//! and keeps it running until interrupted or until it dies on its own.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use serve_harness::{AppError, Harness, HarnessConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "serve-harness", about = "Build and serve a web app in production mode", version, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, conflicts_with_all = ["dir", "cli_entry"])]
    config: Option<PathBuf>,

    /// Application directory (used when no config file is given).
    #[arg(long, required_unless_present = "config")]
    dir: Option<PathBuf>,

    /// Framework CLI entry point passed to the runtime.
    #[arg(long, required_unless_present = "config")]
    cli_entry: Option<PathBuf>,

    /// Override the runtime binary.
    #[arg(long)]
    runtime: Option<String>,

    /// Override the build output directory.
    #[arg(long)]
    dist_dir: Option<PathBuf>,

    /// Seconds to wait for the readiness marker; 0 waits forever.
    #[arg(long)]
    ready_timeout: Option<u64>,

    /// Do not mirror child output to this terminal.
    #[arg(long)]
    quiet: bool,

    /// Print the readiness summary as JSON instead of the bare URL.
    #[arg(long)]
    json: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut harness = Harness::new(load_config(&args)?);
    info!(
        session_id = harness.id(),
        test_dir = %harness.config().test_dir.display(),
        runtime = %harness.config().runtime,
        "configuration loaded"
    );
    let mut fatal = harness
        .take_fatal_errors()
        .ok_or_else(|| AppError::Config("fatal error channel unavailable".into()))?;

    let ready = harness.start().await?;
    if args.json {
        let summary = serde_json::to_string(&ready)
            .map_err(|err| AppError::Io(format!("failed to encode summary: {err}")))?;
        println!("{summary}");
    } else {
        println!("{}", ready.url);
    }

    let outcome = tokio::select! {
        signal = shutdown_signal() => {
            info!(signal, "shutdown signal received");
            Ok(())
        }
        Some(err) = fatal.recv() => {
            error!(%err, "server died");
            Err(err)
        }
    };

    let code = harness.stop().await?;
    info!(?code, "serve-harness shut down");
    outcome
}

fn load_config(args: &Cli) -> Result<HarnessConfig> {
    let mut config = match (&args.config, &args.dir, &args.cli_entry) {
        (Some(path), _, _) => HarnessConfig::load_from_path(path)?,
        (None, Some(dir), Some(cli_entry)) => HarnessConfig::new(dir, cli_entry),
        _ => {
            return Err(AppError::Config(
                "either --config or both --dir and --cli-entry are required".into(),
            ))
        }
    };

    if let Some(runtime) = &args.runtime {
        config.runtime.clone_from(runtime);
    }
    if let Some(dist_dir) = &args.dist_dir {
        config.dist_dir.clone_from(dist_dir);
    }
    if let Some(seconds) = args.ready_timeout {
        config.timeouts.ready_timeout_seconds = seconds;
    }
    if args.quiet {
        config.echo_output = false;
    }

    config.validate()?;
    Ok(config)
}

/// Resolves with the name of the first shutdown signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    name = interrupt() => name,
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable, listening for ctrl-c only");
                interrupt().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupt().await
    }
}

/// Wait for ctrl-c. A handler that fails to install never resolves, so the
/// server keeps running until it dies or is terminated.
async fn interrupt() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

/// Logs go to stderr; stdout carries the child's output and the URL.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
