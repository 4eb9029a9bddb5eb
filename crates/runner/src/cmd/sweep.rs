use std::sync::Arc;

use checkpoint::CheckpointStore;
use clap::Args;
use runner::engine::{host_from_config, registry_config, sweep_settings};
use runner::maintenance::Sweeper;
use runner::paths::EnginePaths;
use runner::store::FileStore;
use runner::{RunnerError, RunnerResult, lock};
use sandbox::SandboxRegistry;

use super::ConfigArgs;

#[derive(Args)]
pub struct SweepArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

/// Run the stale sweep once against an idle base dir.
pub async fn run_sweep(args: SweepArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    let paths = EnginePaths::new(config.base_dir.clone());
    tokio::fs::create_dir_all(paths.base_dir()).await?;

    let Some(_lock) = lock::try_acquire(paths.lock()).await? else {
        return Err(RunnerError::Config(
            "an engine is serving this base dir; it sweeps on its own schedule".into(),
        ));
    };

    let registry = SandboxRegistry::new(host_from_config(&config).await?, registry_config(&config));
    let sweeper = Sweeper::new(
        registry.clone(),
        Arc::new(CheckpointStore::open(paths.checkpoints()).await?),
        Arc::new(FileStore::open(paths.store()).await?),
        sweep_settings(&config),
    );
    let summary = sweeper.sweep().await?;
    registry.shutdown().await;

    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| RunnerError::Internal(format!("encode summary: {e}")))?;
    println!("{json}");
    Ok(())
}
