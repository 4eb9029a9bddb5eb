//! The engine behind the `runner` binary: a persistent priority queue of
//! repository tasks, drained by a worker pool into sandboxes, with
//! checkpointed agent sessions and periodic maintenance.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod lock;
pub mod maintenance;
pub mod paths;
pub mod records;
pub mod repo;
pub mod spool;
pub mod status;
pub mod store;
pub mod tasks;

pub use engine::Engine;
pub use error::{RunnerError, RunnerResult};
