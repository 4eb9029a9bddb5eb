mod init;
mod serve;
mod status;
mod submit;
mod sweep;

use std::path::PathBuf;

use clap::Args;
use runner::RunnerResult;
use runner::config::{self, EngineConfig};

pub use init::{InitArgs, run_init};
pub use serve::{ServeArgs, run_serve};
pub use status::{StatusArgs, run_status};
pub use submit::{SubmitArgs, run_submit};
pub use sweep::{SweepArgs, run_sweep};

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "RUNNER_CONFIG")]
    config: PathBuf,
}

impl ConfigArgs {
    async fn load(&self) -> RunnerResult<EngineConfig> {
        config::load(&self.config).await
    }
}
