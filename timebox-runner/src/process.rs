use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use timebox_core::{EnvironmentMode, ExecutionReport, ProcessConfig, ProcessError, RunState};
use tracing::debug;

use crate::executor;

/// A single-use external process with a bounded wall-clock lifetime.
///
/// Configure it with the chaining builder methods, then call [`run`] or
/// [`run_in_dir`] exactly once. The timeout clock starts when the run
/// starts, not when the handle is built.
///
/// Dropping the future returned by a run kills the child.
///
/// [`run`]: TimedProcess::run
/// [`run_in_dir`]: TimedProcess::run_in_dir
#[derive(Debug, Clone)]
pub struct TimedProcess {
    config: ProcessConfig,
    state: RunState,
}

impl TimedProcess {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            config: ProcessConfig::new(program),
            state: RunState::NotYetRun,
        }
    }

    pub fn with_timeout(program: impl Into<String>, timeout: Duration) -> Self {
        Self::new(program).set_timeout(timeout)
    }

    pub fn arg(self, arg: impl Into<String>) -> Self {
        self.add_args([arg])
    }

    /// Appends positional arguments. Empty strings are passed through.
    pub fn add_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(self, entry: impl Into<String>) -> Self {
        self.add_envs([entry])
    }

    /// Appends raw `KEY=VALUE` entries for the child.
    pub fn add_envs<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.envs.extend(entries.into_iter().map(Into::into));
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn set_grace_period(mut self, grace_period: Duration) -> Self {
        self.config.grace_period = grace_period;
        self
    }

    pub fn environment_mode(mut self, mode: EnvironmentMode) -> Self {
        self.config.environment_mode = mode;
        self
    }

    pub fn program(&self) -> &str {
        &self.config.program
    }

    pub fn args(&self) -> &[String] {
        &self.config.args
    }

    pub fn envs(&self) -> &[String] {
        &self.config.envs
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs in the caller's working directory.
    pub async fn run(&mut self) -> Result<String, ProcessError> {
        let config = self.freeze(None)?;
        executor::execute(&config).await
    }

    /// Runs with `dir` as the working directory.
    ///
    /// A missing directory fails before anything is spawned and leaves the
    /// handle unused.
    pub async fn run_in_dir(&mut self, dir: impl AsRef<Path>) -> Result<String, ProcessError> {
        let dir = dir.as_ref();
        self.ensure_not_run()?;

        if !is_dir(dir) {
            debug!(
                program = %self.config.program,
                dir = %dir.display(),
                "Working directory missing, not spawning"
            );
            return Err(ProcessError::DirectoryNotFound {
                path: dir.to_path_buf(),
            });
        }

        let config = self.freeze(Some(dir))?;
        executor::execute(&config).await
    }

    /// Runs like [`run`](Self::run) or [`run_in_dir`](Self::run_in_dir) and
    /// wraps the result with timing metadata.
    pub async fn run_with_report(&mut self, dir: Option<&Path>) -> ExecutionReport {
        let started_at = Utc::now();
        let result = match dir {
            Some(dir) => self.run_in_dir(dir).await,
            None => self.run().await,
        };
        let completed_at = Utc::now();

        let mut config = self.config.clone();
        config.working_directory = dir.map(Path::to_path_buf);
        ExecutionReport::new(&config, result, started_at, completed_at)
    }

    fn ensure_not_run(&self) -> Result<(), ProcessError> {
        if self.state == RunState::Completed {
            return Err(ProcessError::AlreadyRun {
                program: self.config.program.clone(),
            });
        }
        Ok(())
    }

    /// Takes the snapshot a run executes against and marks the handle used.
    fn freeze(&mut self, dir: Option<&Path>) -> Result<ProcessConfig, ProcessError> {
        self.ensure_not_run()?;

        if self.config.timeout.is_zero() {
            return Err(ProcessError::InvalidTimeout {
                program: self.config.program.clone(),
            });
        }

        self.state = RunState::Completed;

        let mut config = self.config.clone();
        config.working_directory = dir.map(Path::to_path_buf);
        Ok(config)
    }
}

impl fmt::Display for TimedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] [{}]",
            self.config.program,
            self.config.args.join(" "),
            self.config.envs.join(" ")
        )
    }
}

/// Whether `path` exists and is a directory.
pub fn is_dir(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}
