//! Harness configuration parsing, defaults, and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Environment overrides applied to every spawned child on top of the
/// inherited process environment.
///
/// An empty `NODE_ENV` lets the framework pick its own mode, the test-mode
/// flag enables test hooks, and the random-port flag avoids port clashes
/// between parallel test runs.
pub const DEFAULT_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("NODE_ENV", ""),
    ("__NEXT_TEST_MODE", "1"),
    ("__NEXT_RAND_PORT", "1"),
];

/// Name of the build identifier file written into the dist directory.
pub const BUILD_ID_FILE: &str = "BUILD_ID";

/// Timeout values (seconds) for the blocking lifecycle waits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Readiness wait timeout; 0 means wait forever.
    #[serde(default)]
    pub ready_timeout_seconds: u64,
    /// Grace period between the termination signal and a forced kill.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready_timeout_seconds: 0,
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Readiness timeout, or `None` when the wait is unbounded.
    #[must_use]
    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.ready_timeout_seconds > 0).then(|| Duration::from_secs(self.ready_timeout_seconds))
    }

    /// Grace period granted to the server after the termination signal.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

fn default_stop_grace_seconds() -> u64 {
    5
}

fn default_runtime() -> String {
    "node".into()
}

fn default_build_args() -> Vec<String> {
    vec!["build".into()]
}

fn default_start_args() -> Vec<String> {
    vec!["start".into()]
}

fn default_dist_dir() -> PathBuf {
    PathBuf::from(".next")
}

fn default_true() -> bool {
    true
}

fn default_max_output_bytes() -> usize {
    16 * 1024 * 1024
}

/// Harness configuration parsed from a TOML file or built in code.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HarnessConfig {
    /// Application directory; both sub-runs start here.
    pub test_dir: PathBuf,
    /// Runtime binary used to launch the framework CLI.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Framework CLI entry point, passed as the first runtime argument.
    pub cli_entry: PathBuf,
    /// Arguments following the CLI entry for the build sub-run.
    #[serde(default = "default_build_args")]
    pub build_args: Vec<String>,
    /// Arguments following the CLI entry for the serve sub-run.
    #[serde(default = "default_start_args")]
    pub start_args: Vec<String>,
    /// Build output directory, relative to `test_dir` unless absolute.
    #[serde(default = "default_dist_dir")]
    pub dist_dir: PathBuf,
    /// Extra environment overrides, applied after [`DEFAULT_ENV_OVERRIDES`].
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Mirror child output onto this process's stdout/stderr.
    #[serde(default = "default_true")]
    pub echo_output: bool,
    /// Upper bound on bytes retained in the accumulated output log.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Timeout configuration for blocking waits.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl HarnessConfig {
    /// Build a configuration in code with defaults for everything except
    /// the application directory and the CLI entry point.
    #[must_use]
    pub fn new(test_dir: impl Into<PathBuf>, cli_entry: impl Into<PathBuf>) -> Self {
        Self {
            test_dir: test_dir.into(),
            runtime: default_runtime(),
            cli_entry: cli_entry.into(),
            build_args: default_build_args(),
            start_args: default_start_args(),
            dist_dir: default_dist_dir(),
            env: BTreeMap::new(),
            echo_output: true,
            max_output_bytes: default_max_output_bytes(),
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values and canonicalize `test_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on an empty runtime, a zero output bound,
    /// or a `test_dir` that does not exist.
    pub fn validate(&mut self) -> Result<()> {
        if self.runtime.trim().is_empty() {
            return Err(AppError::Config("runtime must not be empty".into()));
        }

        if self.max_output_bytes == 0 {
            return Err(AppError::Config(
                "max_output_bytes must be greater than zero".into(),
            ));
        }

        let canonical = self
            .test_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("test_dir invalid: {err}")))?;
        self.test_dir = canonical;

        Ok(())
    }

    /// Absolute path of the build output directory.
    #[must_use]
    pub fn dist_path(&self) -> PathBuf {
        self.test_dir.join(&self.dist_dir)
    }

    /// Environment overrides for spawned children: the fixed defaults
    /// followed by the configured extras (extras win on conflict).
    #[must_use]
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = DEFAULT_ENV_OVERRIDES
            .iter()
            .map(|&(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        merged.extend(self.env.clone());
        merged.into_iter().collect()
    }
}
