//! Host backends for the `sandbox` crate.

mod command;
mod docker;
mod prerequisites;
mod process;
mod process_host;

pub use command::CommandError;
pub use docker::{DockerConfig, DockerHost};
pub use prerequisites::{check_docker, check_process_host};
pub use process_host::ProcessHost;
