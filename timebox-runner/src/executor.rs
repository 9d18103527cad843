use std::process::{ExitStatus, Stdio};

use timebox_core::{EnvironmentMode, ProcessConfig, ProcessError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::deadline::{Deadline, Race};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Launches the process described by `config` and drives it to exit or
/// to the deadline, whichever comes first.
pub(crate) async fn execute(config: &ProcessConfig) -> Result<String, ProcessError> {
    let run_id = Uuid::new_v4();
    let program = config.program.as_str();

    info!(
        run_id = %run_id,
        program = %program,
        args = ?config.args,
        timeout_ms = config.timeout.as_millis() as u64,
        "Starting process"
    );

    let deadline = Deadline::start(config.timeout);
    let mut command = build_command(config);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let lookup = program.to_string();
            let on_path = tokio::task::spawn_blocking(move || which::which(lookup).is_ok())
                .await
                .unwrap_or(false);
            error!(
                run_id = %run_id,
                program = %program,
                on_path,
                error = %source,
                "Failed to spawn process"
            );
            return Err(ProcessError::SpawnFailure {
                program: program.to_string(),
                source,
            });
        }
    };

    debug!(run_id = %run_id, pid = ?child.id(), "Process spawned");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let readers = Readers(
        [
            child.stdout.take().map(|out| spawn_reader(out, tx.clone())),
            child.stderr.take().map(|err| spawn_reader(err, tx.clone())),
        ]
        .into_iter()
        .flatten()
        .collect(),
    );
    drop(tx);

    let mut combined = Vec::new();

    let raced = deadline
        .race(wait_collecting(&mut child, &mut rx, &mut combined))
        .await;

    let status = match raced {
        Race::Finished(Ok(status)) => Some(status),
        Race::Finished(Err(source)) => {
            drop(readers);
            error!(
                run_id = %run_id,
                program = %program,
                error = %source,
                "Failed to wait on process"
            );
            return Err(ProcessError::Io {
                program: program.to_string(),
                source,
            });
        }
        Race::Expired => {
            warn!(
                run_id = %run_id,
                program = %program,
                timeout_ms = config.timeout.as_millis() as u64,
                "Deadline exceeded, killing process"
            );
            if let Err(e) = child.start_kill() {
                debug!(run_id = %run_id, error = %e, "Kill failed, process already gone");
            }
            None
        }
    };

    // Let the child flush and exit for at most the grace period.
    let settle = async {
        if status.is_none() {
            let _ = child.wait().await;
        }
        while let Some(chunk) = rx.recv().await {
            combined.extend_from_slice(&chunk);
        }
    };
    if tokio::time::timeout(config.grace_period, settle).await.is_err() {
        debug!(
            run_id = %run_id,
            grace_ms = config.grace_period.as_millis() as u64,
            "Output still open after grace period, reclaiming readers"
        );
    }

    drop(readers);
    while let Ok(chunk) = rx.try_recv() {
        combined.extend_from_slice(&chunk);
    }

    let output = String::from_utf8_lossy(&combined).into_owned();
    let elapsed_ms = deadline.elapsed().as_millis() as u64;

    match status {
        Some(status) if status.success() => {
            info!(run_id = %run_id, program = %program, elapsed_ms, "Process completed");
            Ok(output)
        }
        Some(status) => {
            info!(
                run_id = %run_id,
                program = %program,
                exit_code = ?status.code(),
                elapsed_ms,
                "Process exited unsuccessfully"
            );
            Err(ProcessError::NonZeroExit {
                program: program.to_string(),
                status,
                output,
            })
        }
        None => Err(ProcessError::TimeoutExceeded {
            program: program.to_string(),
            timeout: config.timeout,
            output,
        }),
    }
}

/// Output reader tasks, aborted when dropped.
///
/// Dropping the run future also drops this, so readers blocked on pipes held
/// open by a grandchild do not outlive the run.
struct Readers(Vec<JoinHandle<()>>);

impl Drop for Readers {
    fn drop(&mut self) {
        self.0.iter().for_each(JoinHandle::abort);
    }
}

fn build_command(config: &ProcessConfig) -> Command {
    let mut command = Command::new(&config.program);
    command.args(&config.args);

    if config.environment_mode == EnvironmentMode::ExplicitOnly {
        command.env_clear();
    }
    command.envs(config.env_pairs());

    if let Some(dir) = &config.working_directory {
        command.current_dir(dir);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Waits for the child while appending forwarded output chunks.
async fn wait_collecting(
    child: &mut Child,
    rx: &mut UnboundedReceiver<Vec<u8>>,
    combined: &mut Vec<u8>,
) -> std::io::Result<ExitStatus> {
    let mut streams_open = true;
    loop {
        tokio::select! {
            status = child.wait() => return status,
            chunk = rx.recv(), if streams_open => match chunk {
                Some(chunk) => combined.extend_from_slice(&chunk),
                None => streams_open = false,
            },
        }
    }
}

fn spawn_reader<R>(mut stream: R, tx: UnboundedSender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use timebox_core::ErrorKind;

    fn config(program: &str, args: &[&str]) -> ProcessConfig {
        let mut config = ProcessConfig::new(program);
        config.args = args.iter().map(|a| a.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn test_execute_collects_large_output() {
        let script = "i=0; while [ $i -lt 5000 ]; do echo line-$i; i=$((i+1)); done";
        let config = config("sh", &["-c", script]);

        let output = execute(&config).await.unwrap();

        assert_eq!(output.lines().count(), 5000);
        assert_eq!(output.lines().last(), Some("line-4999"));
    }

    #[tokio::test]
    async fn test_execute_decodes_invalid_utf8_lossily() {
        let config = config("printf", &["ok\\377\\n"]);

        let output = execute(&config).await.unwrap();

        assert_eq!(output, "ok\u{FFFD}\n");
    }

    #[tokio::test]
    async fn test_grace_period_bounds_orphaned_pipes() {
        let mut config = config("sh", &["-c", "sleep 5 & echo bg"]);
        config.grace_period = Duration::from_millis(50);

        let start = std::time::Instant::now();
        let output = execute(&config).await.unwrap();

        assert_eq!(output, "bg\n");
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dropping_readers_aborts_tasks() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _held = tx;
            std::future::pending::<()>().await;
        });

        drop(Readers(vec![task]));

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_for_unknown_program() {
        let config = config("definitely-not-a-real-program-timebox", &[]);

        let err = execute(&config).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SpawnFailure);
    }

    #[tokio::test]
    async fn test_timeout_reports_configured_duration() {
        let mut config = config("sleep", &["5"]);
        config.timeout = Duration::from_millis(100);

        let err = execute(&config).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
        assert_eq!(err.to_string(), "`sleep` timed out after 100ms");
    }

    #[tokio::test]
    async fn test_spawn_failure_in_missing_directory() {
        let mut config = config("true", &[]);
        config.working_directory = Some("/definitely/not/here/timebox".into());

        let err = execute(&config).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SpawnFailure);
    }
}
