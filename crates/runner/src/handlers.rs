//! AI background tasks: issue triage and pull request review.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use task_queue::{HandlerError, Task, TaskHandler};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::records::{AiResult, AiResultKind};
use crate::repo::{self, Repositories};
use crate::store::{Store, StoreExt};
use crate::tasks::{IssueTriage, PrReview, TaskPayload};

/// Diffs longer than this are cut before they reach the model.
const MAX_DIFF_BYTES: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("no model provider configured")]
    NotConfigured,

    /// Worth trying again later.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model rejected the request: {0}")]
    Rejected(String),
}

impl From<ModelError> for HandlerError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Unavailable(_) => HandlerError::retryable(err.to_string()),
            ModelError::NotConfigured | ModelError::Rejected(_) => HandlerError::permanent(err.to_string()),
        }
    }
}

/// Opaque model provider.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Used when no provider is configured; every request fails permanently.
pub struct NoModel;

#[async_trait]
impl ModelClient for NoModel {
    async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
        Err(ModelError::NotConfigured)
    }
}

/// Runs a local command with the prompt on stdin and takes stdout as the
/// answer. Exit status 75 (`EX_TEMPFAIL`) and timeouts are retryable.
pub struct CommandModelClient {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

const EX_TEMPFAIL: i32 = 75;

impl CommandModelClient {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, ModelError> {
        let Some((program, args)) = command.split_first() else {
            return Err(ModelError::NotConfigured);
        };
        let program = which::which(program)
            .map_err(|e| ModelError::Rejected(format!("model command {program}: {e}")))?;
        Ok(Self {
            program,
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl ModelClient for CommandModelClient {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ModelError::Unavailable(format!("spawn {}: {e}", self.program.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ModelError::Unavailable(format!("write prompt: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ModelError::Unavailable(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| ModelError::Unavailable(format!("wait: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
            Some(EX_TEMPFAIL) | None => Err(ModelError::Unavailable(stderr)),
            Some(code) => Err(ModelError::Rejected(format!("exit {code}: {stderr}"))),
        }
    }
}

fn triage_prompt(issue: &IssueTriage) -> String {
    format!(
        "Triage this issue. Suggest labels, a priority (low, medium, high) and \
         whether it is a duplicate or needs more information.\n\n\
         Title: {}\n\n{}\n",
        issue.title, issue.body
    )
}

fn review_prompt(pr: &PrReview, diff: &str) -> String {
    format!(
        "Review this pull request. Point out bugs, risky changes and missing \
         tests. Be concise.\n\nTitle: {}\nCompare: {}...{}\n\n```diff\n{}\n```\n",
        pr.title, pr.base, pr.head, diff
    )
}

/// Cut at a char boundary at or below `max` bytes.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.get(..end).unwrap_or_default()
}

/// Keyed by task id; a retried task replaces its earlier result.
async fn save_result(store: &dyn Store, result: AiResult) -> Result<(), HandlerError> {
    store
        .upsert_record(&result)
        .await
        .map_err(|e| HandlerError::retryable(format!("store result: {e}")))
}

pub struct TriageHandler {
    model: Arc<dyn ModelClient>,
    store: Arc<dyn Store>,
}

impl TriageHandler {
    pub fn new(model: Arc<dyn ModelClient>, store: Arc<dyn Store>) -> Self {
        Self { model, store }
    }
}

#[async_trait]
impl TaskHandler<TaskPayload> for TriageHandler {
    async fn handle(&self, task: &Task<TaskPayload>) -> Result<(), HandlerError> {
        let TaskPayload::IssueTriage(issue) = &task.payload else {
            return Err(HandlerError::permanent(format!("unexpected payload for triage: {}", task.kind())));
        };

        let output = self.model.complete(&triage_prompt(issue)).await?;
        info!(task_id = %task.id, repo_id = %issue.repo_id, issue = issue.issue_number, "issue triaged");
        save_result(
            self.store.as_ref(),
            AiResult {
                id: task.id.to_string(),
                kind: AiResultKind::Triage,
                repo_id: issue.repo_id.clone(),
                number: issue.issue_number,
                output,
                created_at: Utc::now(),
            },
        )
        .await
    }
}

pub struct ReviewHandler {
    model: Arc<dyn ModelClient>,
    store: Arc<dyn Store>,
    repos: Arc<dyn Repositories>,
}

impl ReviewHandler {
    pub fn new(model: Arc<dyn ModelClient>, store: Arc<dyn Store>, repos: Arc<dyn Repositories>) -> Self {
        Self { model, store, repos }
    }
}

#[async_trait]
impl TaskHandler<TaskPayload> for ReviewHandler {
    async fn handle(&self, task: &Task<TaskPayload>) -> Result<(), HandlerError> {
        let TaskPayload::PrReview(pr) = &task.payload else {
            return Err(HandlerError::permanent(format!("unexpected payload for review: {}", task.kind())));
        };

        let repo = self.repos.path(&pr.repo_id).await.map_err(repo_failure)?;
        let diff = repo::diff(&repo, &pr.base, &pr.head).await.map_err(repo_failure)?;
        if diff.trim().is_empty() {
            return Err(HandlerError::permanent(format!(
                "nothing to review between {} and {}",
                pr.base, pr.head
            )));
        }
        debug!(task_id = %task.id, diff_bytes = diff.len(), "diff collected");

        let output = self
            .model
            .complete(&review_prompt(pr, truncate(&diff, MAX_DIFF_BYTES)))
            .await?;
        info!(task_id = %task.id, repo_id = %pr.repo_id, pr = pr.pr_number, "pull request reviewed");
        save_result(
            self.store.as_ref(),
            AiResult {
                id: task.id.to_string(),
                kind: AiResultKind::Review,
                repo_id: pr.repo_id.clone(),
                number: pr.pr_number,
                output,
                created_at: Utc::now(),
            },
        )
        .await
    }
}

pub(crate) fn repo_failure(err: repo::RepoError) -> HandlerError {
    if err.is_retryable() {
        HandlerError::retryable(err.to_string())
    } else {
        HandlerError::permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::store::MemoryStore;
    use crate::tasks::TaskRequest;

    use super::*;

    /// Answers from a script of canned results and remembers the prompts.
    struct ScriptedModel {
        answers: Mutex<Vec<Result<String, ModelError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(answers: Vec<Result<String, ModelError>>) -> Self {
            Self {
                answers: Mutex::new(answers),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                Ok("ok".into())
            } else {
                answers.remove(0)
            }
        }
    }

    fn triage_task() -> Task<TaskPayload> {
        TaskRequest::new(TaskPayload::IssueTriage(IssueTriage {
            repo_id: "app".into(),
            issue_number: 7,
            title: "Crash on save".into(),
            body: "Stack trace attached".into(),
        }))
        .into_task()
        .unwrap()
    }

    #[tokio::test]
    async fn triage_stores_the_model_output() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("labels: bug".into())]));
        let store = Arc::new(MemoryStore::new());
        let handler = TriageHandler::new(model.clone(), store.clone());
        let task = triage_task();

        handler.handle(&task).await.unwrap();

        let result: AiResult = store.get_record(task.id.as_str()).await.unwrap().unwrap();
        assert_eq!(result.kind, AiResultKind::Triage);
        assert_eq!(result.number, 7);
        assert_eq!(result.output, "labels: bug");
        assert!(model.prompts.lock().unwrap()[0].contains("Crash on save"));
    }

    #[tokio::test]
    async fn missing_provider_fails_permanently() {
        let handler = TriageHandler::new(Arc::new(NoModel), Arc::new(MemoryStore::new()));
        let err = handler.handle(&triage_task()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "no model provider configured");
    }

    #[tokio::test]
    async fn unavailable_model_is_retryable() {
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::Unavailable("busy".into()))]));
        let handler = TriageHandler::new(model, Arc::new(MemoryStore::new()));
        let err = handler.handle(&triage_task()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retried_triage_overwrites_its_result() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("first".into()), Ok("second".into())]));
        let store = Arc::new(MemoryStore::new());
        let handler = TriageHandler::new(model, store.clone());
        let task = triage_task();

        handler.handle(&task).await.unwrap();
        handler.handle(&task).await.unwrap();

        let result: AiResult = store.get_record(task.id.as_str()).await.unwrap().unwrap();
        assert_eq!(result.output, "second");
    }

    #[tokio::test]
    async fn command_client_pipes_the_prompt() {
        let client = CommandModelClient::new(
            &["bash".into(), "-c".into(), "tr a-z A-Z".into()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.complete("looks good").await.unwrap(), "LOOKS GOOD");
    }

    #[tokio::test]
    async fn command_client_maps_exit_codes() {
        let tempfail = CommandModelClient::new(
            &["bash".into(), "-c".into(), "cat >/dev/null; echo busy >&2; exit 75".into()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(tempfail.complete("x").await, Err(ModelError::Unavailable(m)) if m == "busy"));

        let rejected = CommandModelClient::new(
            &["bash".into(), "-c".into(), "cat >/dev/null; exit 2".into()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(rejected.complete("x").await, Err(ModelError::Rejected(_))));
    }

    #[tokio::test]
    async fn command_client_times_out() {
        let client = CommandModelClient::new(
            &["bash".into(), "-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(matches!(client.complete("x").await, Err(ModelError::Unavailable(_))));
    }

    #[test]
    fn empty_command_means_no_provider() {
        assert!(matches!(
            CommandModelClient::new(&[], Duration::from_secs(1)),
            Err(ModelError::NotConfigured)
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
