use std::path::PathBuf;

use clap::Args;
use runner::config::{self, Backend, CONFIG_FILE, EngineConfig};
use runner::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct InitArgs {
    /// Base directory for runtime data; runner.yaml is written there
    #[arg(long)]
    base_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = Backend::Process)]
    backend: Backend,
    #[arg(long, default_value_t = task_queue::DEFAULT_WORKERS)]
    workers: usize,
    /// Replace an existing runner.yaml
    #[arg(long)]
    force: bool,
}

/// Write a default config and print its path.
pub async fn run_init(args: InitArgs) -> RunnerResult<()> {
    let base_dir = if args.base_dir.is_absolute() {
        args.base_dir
    } else {
        std::env::current_dir()?.join(args.base_dir)
    };
    let target = base_dir.join(CONFIG_FILE);
    if !args.force && tokio::fs::try_exists(&target).await? {
        return Err(RunnerError::Config(format!(
            "{} exists (use --force to replace it)",
            target.display()
        )));
    }

    let mut config = EngineConfig::new(base_dir);
    config.sandbox.backend = args.backend;
    config.queue.workers = args.workers;
    config.validate()?;

    let path = config::generate(&config).await?;
    println!("{}", path.display());
    Ok(())
}
