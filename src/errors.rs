//! Error types shared across the harness.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared harness result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Harness error enumeration covering all lifecycle failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// A start was requested while a child process is still owned.
    AlreadyStarted,
    /// The build sub-run exited with a non-zero code.
    BuildFailed(i32),
    /// The serve sub-run exited without a prior stop request.
    ///
    /// `None` when the process was terminated by a signal.
    UnexpectedExit(Option<i32>),
    /// The operating system refused to spawn the command.
    Spawn(String),
    /// The readiness marker carried a value that is not a valid URL.
    InvalidUrl(String),
    /// No readiness marker was observed within the configured window.
    ReadyTimeout(Duration),
    /// An operation required a live child process but none exists.
    NotRunning,
    /// The requested lifecycle step is not allowed from the current state.
    InvalidTransition(String),
    /// File-system or stream I/O failure.
    Io(String),
}

impl AppError {
    /// Exit code carried by the error, if any.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::BuildFailed(code) => Some(*code),
            Self::UnexpectedExit(code) => *code,
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::AlreadyStarted => write!(f, "already started: a child process is still running"),
            Self::BuildFailed(code) => write!(f, "build failed: exited with code {code}"),
            Self::UnexpectedExit(Some(code)) => {
                write!(f, "unexpected exit: server exited with code {code}")
            }
            Self::UnexpectedExit(None) => {
                write!(f, "unexpected exit: server terminated by signal")
            }
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::InvalidUrl(msg) => write!(f, "invalid url: {msg}"),
            Self::ReadyTimeout(after) => {
                write!(f, "ready timeout: no readiness marker within {after:?}")
            }
            Self::NotRunning => write!(f, "not running: no child process is owned"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}
