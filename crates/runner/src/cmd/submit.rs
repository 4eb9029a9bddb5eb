use std::path::PathBuf;

use clap::Args;
use runner::paths::EnginePaths;
use runner::spool::Spool;
use runner::tasks::{TaskPayload, TaskRequest};
use runner::{RunnerError, RunnerResult};
use serde_json::{Map, Value};
use task_queue::Origin;

use super::ConfigArgs;

#[derive(Args)]
pub struct SubmitArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Task request JSON file
    #[arg(long, conflicts_with_all = ["task_type", "payload"])]
    file: Option<PathBuf>,
    /// Task type, e.g. action_run or agent_session
    #[arg(long = "type", required_unless_present = "file")]
    task_type: Option<String>,
    /// Task payload as JSON
    #[arg(long)]
    payload: Option<String>,
    /// Lower runs first
    #[arg(long)]
    priority: Option<i32>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    repo_id: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long)]
    entity_id: Option<String>,
}

fn invalid(message: String) -> RunnerError {
    RunnerError::InvalidRequest(message)
}

async fn read_request(args: &SubmitArgs) -> RunnerResult<TaskRequest> {
    if let Some(file) = &args.file {
        let content = tokio::fs::read_to_string(file).await?;
        return serde_json::from_str(&content).map_err(|e| invalid(format!("{}: {e}", file.display())));
    }

    let Some(task_type) = &args.task_type else {
        return Err(invalid("--type or --file is required".into()));
    };
    let mut task = Map::new();
    task.insert("type".into(), Value::String(task_type.clone()));
    if let Some(payload) = &args.payload {
        let payload: Value = serde_json::from_str(payload).map_err(|e| invalid(format!("--payload: {e}")))?;
        task.insert("payload".into(), payload);
    }
    let task: TaskPayload = serde_json::from_value(Value::Object(task)).map_err(|e| invalid(format!("task: {e}")))?;
    Ok(TaskRequest::new(task))
}

/// Spool a task request and print its id.
pub async fn run_submit(args: SubmitArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    let mut request = read_request(&args).await?;

    if args.priority.is_some() {
        request.priority = args.priority;
    }
    if args.max_retries.is_some() {
        request.max_retries = args.max_retries;
    }
    let origin = Origin {
        repo_id: args.repo_id,
        user_id: args.user_id,
        entity_type: args.entity_type,
        entity_id: args.entity_id,
    };
    if origin != Origin::default() {
        request.origin = origin;
    }

    let spool = Spool::open(&EnginePaths::new(config.base_dir)).await?;
    let id = spool.submit(&request).await?;
    println!("{id}");
    Ok(())
}
