use clap::Args;
use runner::config::Backend;
use runner::engine::{self, Engine};
use runner::paths::EnginePaths;
use runner::{RunnerError, RunnerResult, lock};
use tracing::info;

use super::ConfigArgs;

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Number of workers (overrides config)
    #[arg(long, env = "RUNNER_WORKERS")]
    workers: Option<usize>,
    /// Sandbox backend (overrides config)
    #[arg(long, value_enum)]
    backend: Option<Backend>,
}

/// Load config, take the base-dir lock and serve until a signal stops us.
pub async fn run_serve(args: ServeArgs) -> RunnerResult<()> {
    let mut config = args.config.load().await?;
    if let Some(workers) = args.workers {
        config.queue.workers = workers;
    }
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    config.validate()?;

    tokio::fs::create_dir_all(&config.base_dir).await.map_err(|e| {
        RunnerError::Config(format!("create base_dir {}: {e}", config.base_dir.display()))
    })?;
    let paths = EnginePaths::new(config.base_dir.clone());
    let Some(_lock) = lock::try_acquire(paths.lock()).await? else {
        return Err(RunnerError::Config(format!(
            "another engine is serving {}",
            paths.base_dir().display()
        )));
    };

    let host = engine::host_from_config(&config).await?;
    let model = engine::model_from_config(&config)?;
    let engine = Engine::build(config, host, model).await?;
    engine.start().await?;

    let modes = engine::signal_modes();
    engine.serve(modes).await?;
    info!("serve finished");
    Ok(())
}
