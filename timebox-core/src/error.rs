use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Working directory does not exist: {}", path.display())]
    DirectoryNotFound { path: PathBuf },

    #[error("Failed to spawn `{program}`: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {}", humantime::format_duration(*timeout))]
    TimeoutExceeded {
        program: String,
        timeout: Duration,
        output: String,
    },

    #[error("`{program}` exited unsuccessfully ({status})")]
    NonZeroExit {
        program: String,
        status: ExitStatus,
        output: String,
    },

    #[error("`{program}` has already been run; build a new process for another attempt")]
    AlreadyRun { program: String },

    #[error("Invalid timeout for `{program}`: must be greater than zero")]
    InvalidTimeout { program: String },

    #[error("IO error while waiting on `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification of a [`ProcessError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DirectoryNotFound,
    SpawnFailure,
    TimeoutExceeded,
    NonZeroExit,
    AlreadyRun,
    InvalidTimeout,
    Io,
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::DirectoryNotFound { .. } => ErrorKind::DirectoryNotFound,
            ProcessError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            ProcessError::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            ProcessError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            ProcessError::AlreadyRun { .. } => ErrorKind::AlreadyRun,
            ProcessError::InvalidTimeout { .. } => ErrorKind::InvalidTimeout,
            ProcessError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Combined output captured before the failure.
    ///
    /// Empty for errors raised before a child existed.
    pub fn output(&self) -> &str {
        match self {
            ProcessError::TimeoutExceeded { output, .. }
            | ProcessError::NonZeroExit { output, .. } => output,
            _ => "",
        }
    }

    /// Consumes the error, returning the captured combined output.
    pub fn into_output(self) -> String {
        match self {
            ProcessError::TimeoutExceeded { output, .. }
            | ProcessError::NonZeroExit { output, .. } => output,
            _ => String::new(),
        }
    }

    /// Exit code of the child, when it ran to completion with one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::NonZeroExit { status, .. } => status.code(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::TimeoutExceeded
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;
