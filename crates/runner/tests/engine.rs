use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use runner::Engine;
use runner::config::EngineConfig;
use runner::engine::host_from_config;
use runner::handlers::NoModel;
use runner::records::{Action, ArtifactRecord, Run, RunStatus, SessionRecord, SessionStatus};
use runner::store::{Filter, StoreExt};
use runner::tasks::{ActionRun, AgentSession, TaskPayload, TaskRequest};
use tokio_util::sync::CancellationToken;

fn config(base_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(base_dir.to_path_buf());
    config.queue.workers = 3;
    config.queue.retry_backoff = None;
    config.sandbox.poll_interval_ms = 50;
    config.sandbox.stop_grace_secs = 1;
    config.spool.poll_interval_ms = 20;
    config
}

async fn engine(base_dir: &Path) -> Engine {
    let config = config(base_dir);
    let host = host_from_config(&config).await.unwrap();
    let engine = Engine::build(config, host, Arc::new(NoModel)).await.unwrap();
    engine.start().await.unwrap();
    engine
}

fn sh(dir: &Path, script: &str) {
    let status = std::process::Command::new("bash")
        .args(["-c", script])
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "{script}");
}

async fn wait_idle(engine: &Engine) {
    tokio::time::timeout(
        Duration::from_secs(60),
        engine.pool().wait_idle(&CancellationToken::new()),
    )
    .await
    .unwrap();
}

/// Highest number of runs whose [started, finished] intervals overlap.
fn max_overlap(runs: &[Run]) -> usize {
    let mut events: Vec<(DateTime<Utc>, i32)> = Vec::new();
    for run in runs {
        events.push((run.started_at.unwrap(), 1));
        events.push((run.finished_at.unwrap(), -1));
    }
    // Ends sort before starts at the same instant.
    events.sort();
    let mut current = 0i32;
    let mut peak = 0i32;
    for (_, delta) in events {
        current += delta;
        peak = peak.max(current);
    }
    usize::try_from(peak).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_action_runs_share_three_workers() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repos/app");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("input.txt"), "hello\n").unwrap();

    let engine = engine(dir.path()).await;
    engine
        .store()
        .insert_record(&Action {
            id: "build".into(),
            repo_id: "app".into(),
            name: "Build".into(),
            script: "sleep 1; cat \"$SANDBOX_SOURCE/input.txt\" > out.txt; echo built".into(),
            timeout_secs: Some(30),
            artifacts: vec!["out.txt".into()],
            last_status: None,
            last_run_id: None,
            updated_at: None,
        })
        .await
        .unwrap();

    let started = Instant::now();
    for n in 0..10 {
        let mut request = TaskRequest::new(TaskPayload::ActionRun(ActionRun {
            action_id: "build".into(),
            commit: Some(format!("c{n}")),
        }));
        request.priority = Some(n % 5 + 1);
        engine.submit(request).unwrap();
    }
    wait_idle(&engine).await;
    let elapsed = started.elapsed();

    let stats = engine.pool().stats();
    assert_eq!(stats.total_processed, 10);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.queue_length, 0);

    let runs: Vec<Run> = engine.store().search_records(&Filter::new()).await.unwrap();
    assert_eq!(runs.len(), 10);
    assert!(runs.iter().all(|run| run.status == RunStatus::Success), "{runs:?}");
    assert!(runs.iter().all(|run| run.output.contains("built")));
    let peak = max_overlap(&runs);
    assert!(peak <= 3, "{peak} runs overlapped");
    assert!(elapsed < Duration::from_secs(9), "took {elapsed:?}");

    let artifacts: Vec<ArtifactRecord> = engine.store().search_records(&Filter::new()).await.unwrap();
    assert_eq!(artifacts.len(), 10);
    for artifact in &artifacts {
        assert_eq!(std::fs::read_to_string(&artifact.stored_at).unwrap(), "hello\n");
        assert_eq!(artifact.size, 6);
    }

    let action: Action = engine.store().get_record("build").await.unwrap().unwrap();
    assert_eq!(action.last_status, Some(RunStatus::Success));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_session_resumes_after_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repos/app");
    std::fs::create_dir_all(&repo).unwrap();
    sh(
        &repo,
        "git init -q -b main . && echo hi > README && git add README && \
         git -c user.email=t@example.com -c user.name=t commit -q -m init",
    );
    let counter = dir.path().join("setup-runs");
    let gate = dir.path().join("gate");
    let session = AgentSession {
        session_id: "s1".into(),
        repo_id: "app".into(),
        commands: vec![
            format!("echo ran >> {}", counter.display()),
            format!("test -f {} || exit 9", gate.display()),
            "echo done > done.txt".into(),
        ],
        push: None,
    };

    let first = engine(dir.path()).await;
    first
        .submit(TaskRequest::new(TaskPayload::AgentSession(session.clone())))
        .unwrap();
    wait_idle(&first).await;
    let record: SessionRecord = first.store().get_record("s1").await.unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Failed);
    assert_eq!(record.steps_completed, 1);
    assert_eq!(first.pool().stats().total_failed, 1);
    first.shutdown().await;
    drop(first);

    std::fs::write(&gate, "").unwrap();
    let second = engine(dir.path()).await;
    second
        .submit(TaskRequest::new(TaskPayload::AgentSession(session)))
        .unwrap();
    wait_idle(&second).await;

    let record: SessionRecord = second.store().get_record("s1").await.unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.steps_completed, 3);
    assert_eq!(std::fs::read_to_string(&counter).unwrap(), "ran\n");
    second.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_interrupts_a_running_action() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("repos/app")).unwrap();

    let engine = engine(dir.path()).await;
    engine
        .store()
        .insert_record(&Action {
            id: "slow".into(),
            repo_id: "app".into(),
            name: "Slow".into(),
            script: "sleep 30".into(),
            timeout_secs: None,
            artifacts: Vec::new(),
            last_status: None,
            last_run_id: None,
            updated_at: None,
        })
        .await
        .unwrap();
    engine
        .submit(TaskRequest::new(TaskPayload::ActionRun(ActionRun {
            action_id: "slow".into(),
            commit: None,
        })))
        .unwrap();

    let running = Filter::new().field("status", "running");
    for _ in 0..200 {
        let runs: Vec<Run> = engine.store().search_records(&running).await.unwrap();
        if !runs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let started = Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(20));

    let runs: Vec<Run> = engine.store().search_records(&Filter::new()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert_eq!(runs[0].reason.as_deref(), Some("interrupted by engine shutdown"));
}
