use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use timebox_runner::{EnvironmentMode, ErrorKind, ExecutionReport, Outcome, TimedProcess};
use tracing::debug;

/// Exit code used when the child was killed at its deadline.
const EXIT_TIMEOUT: i32 = 124;
/// Exit code used when the child could not be started at all.
const EXIT_NOT_RUN: i32 = 125;

#[derive(Parser, Debug)]
#[command(name = "timebox")]
#[command(about = "Run a program with a wall-clock timeout", long_about = None)]
struct Cli {
    /// Maximum run time (e.g. 500ms, 30s, 2m)
    #[arg(
        short,
        long,
        env = "TIMEBOX_TIMEOUT",
        default_value = "1m",
        value_parser = parse_duration
    )]
    timeout: Duration,

    /// Time allowed for output to drain after the kill signal
    #[arg(long, env = "TIMEBOX_GRACE", default_value = "100ms", value_parser = parse_duration)]
    grace: Duration,

    /// Working directory for the program
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Environment entry for the program (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    envs: Vec<String>,

    /// Do not inherit this shell's environment
    #[arg(long)]
    clean_env: bool,

    /// Print a JSON execution report instead of the raw output
    #[arg(long)]
    json: bool,

    /// Program to run
    program: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let duration = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}

impl Cli {
    fn into_process(self) -> (TimedProcess, Option<PathBuf>, bool) {
        let mode = if self.clean_env {
            EnvironmentMode::ExplicitOnly
        } else {
            EnvironmentMode::InheritCaller
        };

        let process = TimedProcess::with_timeout(self.program, self.timeout)
            .set_grace_period(self.grace)
            .environment_mode(mode)
            .add_args(self.args)
            .add_envs(self.envs);

        (process, self.dir, self.json)
    }
}

fn exit_code(report: &ExecutionReport) -> i32 {
    match report.outcome {
        Outcome::Success => 0,
        Outcome::Failed(ErrorKind::TimeoutExceeded) => EXIT_TIMEOUT,
        Outcome::Failed(ErrorKind::NonZeroExit) => report.exit_code.unwrap_or(1),
        Outcome::Failed(_) => EXIT_NOT_RUN,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (mut timed, dir, json) = Cli::parse().into_process();
    debug!(process = %timed, "Parsed command line");

    let report = timed.run_with_report(dir.as_deref()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let mut stdout = std::io::stdout();
        stdout.write_all(report.output.as_bytes())?;
        stdout.flush()?;
        if let Some(error) = &report.error {
            eprintln!("timebox: {}", error);
        }
    }

    std::process::exit(exit_code(&report));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["timebox", "echo", "hello"]).unwrap();

        assert_eq!(cli.timeout, Duration::from_secs(60));
        assert_eq!(cli.grace, Duration::from_millis(100));
        assert_eq!(cli.program, "echo");
        assert_eq!(cli.args, vec!["hello"]);
        assert!(!cli.clean_env);
        assert!(!cli.json);
    }

    #[test]
    fn test_cli_passes_hyphenated_args_through() {
        let cli = Cli::try_parse_from([
            "timebox", "--timeout", "250ms", "-e", "A=1", "-e", "B=2", "--", "ls", "-la", "--color",
        ])
        .unwrap();

        assert_eq!(cli.timeout, Duration::from_millis(250));
        assert_eq!(cli.envs, vec!["A=1", "B=2"]);
        assert_eq!(cli.program, "ls");
        assert_eq!(cli.args, vec!["-la", "--color"]);
    }

    #[test]
    fn test_cli_rejects_zero_timeout() {
        assert!(Cli::try_parse_from(["timebox", "--timeout", "0s", "true"]).is_err());
        assert!(Cli::try_parse_from(["timebox", "--timeout", "soon", "true"]).is_err());
    }

    #[test]
    fn test_into_process_applies_options() {
        let cli = Cli::try_parse_from([
            "timebox", "--clean-env", "--json", "-d", "/tmp", "-e", "K=V", "printf", "x",
        ])
        .unwrap();

        let (process, dir, json) = cli.into_process();

        assert_eq!(process.program(), "printf");
        assert_eq!(process.args(), ["x"]);
        assert_eq!(process.envs(), ["K=V"]);
        assert_eq!(dir, Some(PathBuf::from("/tmp")));
        assert!(json);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_codes() {
        let report = TimedProcess::new("true").run_with_report(None).await;
        assert_eq!(exit_code(&report), 0);

        let report = TimedProcess::new("sh")
            .add_args(["-c", "exit 7"])
            .run_with_report(None)
            .await;
        assert_eq!(exit_code(&report), 7);

        let report = TimedProcess::with_timeout("sleep", Duration::from_millis(50))
            .arg("5")
            .run_with_report(None)
            .await;
        assert_eq!(exit_code(&report), EXIT_TIMEOUT);

        let report = TimedProcess::new("true")
            .run_with_report(Some(std::path::Path::new("/definitely/not/here/timebox")))
            .await;
        assert_eq!(exit_code(&report), EXIT_NOT_RUN);
    }
}
