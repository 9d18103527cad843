use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorKind, ProcessError};

/// Default wall-clock budget for a single run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait between the kill signal and force-reclaiming output readers.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// How the child's environment is assembled from the caller's.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentMode {
    /// Start from the caller's environment and layer explicit entries on top.
    #[default]
    InheritCaller,
    /// Start from an empty environment; only explicit entries are visible.
    ExplicitOnly,
}

/// Lifecycle of a single-use process handle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotYetRun,
    Completed,
}

/// Immutable snapshot of everything needed to launch one process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Raw `KEY=VALUE` entries, in insertion order.
    pub envs: Vec<String>,
    pub timeout: Duration,
    pub grace_period: Duration,
    pub environment_mode: EnvironmentMode,
    pub working_directory: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            environment_mode: EnvironmentMode::default(),
            working_directory: None,
        }
    }

    /// Splits each entry on its first `=`.
    ///
    /// Entries without `=` cannot be handed to the OS and are skipped.
    /// Order is preserved, so for duplicate keys the last entry wins.
    pub fn env_pairs(&self) -> Vec<(&str, &str)> {
        self.envs
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Some((key, value)),
                _ => {
                    warn!(
                        program = %self.program,
                        entry = %entry,
                        "Skipping malformed environment entry"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Final classification of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "kind")]
pub enum Outcome {
    Success,
    Failed(ErrorKind),
}

/// Record of one finished run, suitable for logs or JSON output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub id: Uuid,
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn new(
        config: &ProcessConfig,
        result: Result<String, ProcessError>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = completed_at
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0) as u64;

        let (outcome, exit_code, output, error) = match result {
            Ok(output) => (Outcome::Success, Some(0), output, None),
            Err(e) => {
                let kind = e.kind();
                let exit_code = e.exit_code();
                let message = e.to_string();
                (Outcome::Failed(kind), exit_code, e.into_output(), Some(message))
            }
        };

        Self {
            id: Uuid::new_v4(),
            program: config.program.clone(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            outcome,
            exit_code,
            output,
            error,
            duration_ms,
            started_at,
            completed_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
