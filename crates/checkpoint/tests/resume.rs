use std::sync::Arc;
use std::time::Duration;

use checkpoint::{CheckpointStore, OperationError, OperationStatus, ResumableOperation};
use retry::Context;
use serde_json::{Map, Value, json};

fn entry(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

/// Five-step migration killed after step two, then picked up by a new
/// store instance over the same directory, as after a process restart.
#[tokio::test]
async fn restart_continues_from_disk() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());
        let op = ResumableOperation::new("migrate-42", 5, store);
        let cut = tokio::time::timeout(
            Duration::from_millis(300),
            op.run(&Context::background(), |h| async move {
                for table in ["users", "repos"] {
                    h.save_state(entry(table, json!("copied"))).await?;
                    h.next_step().await?;
                }
                std::future::pending::<()>().await;
                Ok(())
            }),
        )
        .await;
        assert!(cut.is_err());
    }

    let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());
    let on_disk = store.load("migrate-42").await.unwrap();
    assert_eq!(on_disk.step, 2);
    assert_eq!(on_disk.metadata.status, OperationStatus::Running);

    let op = ResumableOperation::new("migrate-42", 5, Arc::clone(&store));
    let outcome = op
        .run(&Context::background(), |h| async move {
            let start = h.current_step().await;
            if start != 2 {
                return Err(OperationError::permanent(format!("resumed at {start}")));
            }
            while h.current_step().await < h.total_steps() {
                h.next_step().await?;
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(outcome.started_as, OperationStatus::Resumed);
    assert_eq!(outcome.state.get("users"), Some(&json!("copied")));
    assert_eq!(
        store.load("migrate-42").await.unwrap().metadata.status,
        OperationStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_keep_separate_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let op = ResumableOperation::new(format!("op-{n}"), 10, store);
            op.run(&Context::background(), |h| async move {
                for i in 0..10 {
                    h.save_state(entry("i", json!(i))).await?;
                    h.next_step().await?;
                }
                Ok(())
            })
            .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().step, 10);
    }

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 8);
    assert!(listed.iter().all(|c| c.step == 10 && c.state["i"] == json!(9)));
}
