//! Run external programs with a bounded wall-clock lifetime.

mod deadline;
mod executor;
pub mod process;

pub use process::{is_dir, TimedProcess};
pub use timebox_core::{
    EnvironmentMode, ErrorKind, ExecutionReport, Outcome, ProcessConfig, ProcessError, RunState,
    DEFAULT_GRACE_PERIOD, DEFAULT_TIMEOUT,
};
