mod cmd;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default runner.yaml
    Init(cmd::InitArgs),
    /// Run the engine: workers, scheduler and spool intake
    Serve(cmd::ServeArgs),
    /// Spool a task for the serving engine
    Submit(cmd::SubmitArgs),
    /// Print the engine's status file
    Status(cmd::StatusArgs),
    /// Settle stale runs, checkpoints and sandboxes while no engine runs
    Sweep(cmd::SweepArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Init(args) => cmd::run_init(args).await,
        Command::Serve(args) => cmd::run_serve(args).await,
        Command::Submit(args) => cmd::run_submit(args).await,
        Command::Status(args) => cmd::run_status(args).await,
        Command::Sweep(args) => cmd::run_sweep(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
