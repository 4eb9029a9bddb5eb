use clap::Args;
use runner::paths::EnginePaths;
use runner::{RunnerError, RunnerResult, lock, status};

use super::ConfigArgs;

#[derive(Args)]
pub struct StatusArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

/// Print the status file of the engine serving the configured base dir.
pub async fn run_status(args: StatusArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    let paths = EnginePaths::new(config.base_dir);

    let status = match status::read(&paths.status()).await {
        Ok(status) => status,
        Err(RunnerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RunnerError::Config(format!(
                "no status file in {}; has the engine been served there?",
                paths.base_dir().display()
            )));
        }
        Err(e) => return Err(e),
    };

    // Holding the lock ourselves means no engine is serving.
    if lock::try_acquire(paths.lock()).await?.is_some() {
        eprintln!("engine is not running; status is from its last run");
    }

    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| RunnerError::Internal(format!("encode status: {e}")))?;
    println!("{json}");
    Ok(())
}
