use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use orchestrator_core::{
    CancelOutcome, OrchestratorError, TaskRepository, TaskStatus, WorkerRepository, WorkerStatus,
};
use orchestrator_infrastructure::{SqliteTaskRepository, SqliteWorkerRepository};
use serde_json::json;

mod database_test_utils;
use database_test_utils::{any_capability, plan, plan_task, task, TestDatabase};

#[tokio::test]
async fn test_concurrent_claimers_get_exactly_one_task() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = Arc::new(SqliteTaskRepository::new(test_db.db.clone()));
    repo.insert_tasks(&[task("only", "build", 0)]).await?;

    let mut handles = Vec::new();
    for n in 0..16 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.claim_next(&format!("worker-{n}"), &any_capability())
                .await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await?? {
            winners.push(task);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].status, TaskStatus::Assigned);
    assert!(winners[0].assignee.is_some());
    Ok(())
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_age() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[
        task("low-old", "build", 1),
        task("high", "build", 9),
        task("low-new", "build", 1),
    ])
    .await?;

    let mut order = Vec::new();
    while let Some(task) = repo.claim_next("w", &any_capability()).await? {
        order.push(task.id);
    }
    assert_eq!(order, vec!["high", "low-old", "low-new"]);
    Ok(())
}

#[tokio::test]
async fn test_claim_respects_capabilities() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[task("t1", "deploy", 0)]).await?;

    assert!(repo.claim_next("w", &[]).await?.is_none());
    assert!(repo
        .claim_next("w", &["build".to_string()])
        .await?
        .is_none());
    let claimed = repo.claim_next("w", &["deploy".to_string()]).await?;
    assert_eq!(claimed.map(|t| t.id), Some("t1".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_dependencies_gate_claims() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    let header = plan("p1");
    let tasks = vec![
        plan_task("p1", "p1:a", "build"),
        plan_task("p1", "p1:b", "build"),
    ];
    repo.insert_plan(
        &header,
        &tasks,
        &[("p1:b".to_string(), "p1:a".to_string())],
    )
    .await?;

    let stored = repo.get("p1:b").await?.expect("task b");
    assert_eq!(stored.depends_on, vec!["p1:a".to_string()]);

    let first = repo.claim_next("w", &any_capability()).await?.expect("a");
    assert_eq!(first.id, "p1:a");
    assert!(repo.claim_next("w", &any_capability()).await?.is_none());

    repo.transition("p1:a", TaskStatus::Running, None).await?;
    assert!(repo.ready_dependents("p1:a").await?.is_empty());
    repo.transition("p1:a", TaskStatus::Completed, Some(json!({"ok": true})))
        .await?;

    let ready: Vec<String> = repo
        .ready_dependents("p1:a")
        .await?
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec!["p1:b"]);
    let second = repo.claim_next("w", &any_capability()).await?.expect("b");
    assert_eq!(second.id, "p1:b");

    let all = repo.plan_tasks("p1").await?;
    assert_eq!(all.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_plan_insert_leaves_no_rows() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[task("p2:a", "build", 0)]).await?;

    let result = repo
        .insert_plan(
            &plan("p2"),
            &[plan_task("p2", "p2:b", "build"), plan_task("p2", "p2:a", "build")],
            &[],
        )
        .await;
    assert!(matches!(result, Err(OrchestratorError::Conflict(_))));
    assert!(repo.get_plan("p2").await?.is_none());
    assert!(repo.get("p2:b").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_transition_rules() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[task("t", "build", 0)]).await?;

    let invalid = repo.transition("t", TaskStatus::Completed, None).await;
    assert!(matches!(
        invalid,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    let missing = repo.transition("nope", TaskStatus::Running, None).await;
    assert!(matches!(missing, Err(OrchestratorError::TaskNotFound { .. })));

    repo.claim_next("w", &any_capability()).await?;
    let running = repo.transition("t", TaskStatus::Running, None).await?;
    assert!(running.is_applied());
    assert_eq!(running.task().assignee.as_deref(), Some("w"));

    let again = repo.transition("t", TaskStatus::Running, None).await?;
    assert!(!again.is_applied());

    let done = repo
        .transition("t", TaskStatus::Completed, Some(json!({"artifact": "x"})))
        .await?;
    assert_eq!(done.task().status, TaskStatus::Completed);
    assert!(done.task().assignee.is_none());
    assert_eq!(done.task().result, Some(json!({"artifact": "x"})));

    let after_terminal = repo.transition("t", TaskStatus::Running, None).await;
    assert!(matches!(
        after_terminal,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_failure_requeues_until_retries_exhausted() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    let mut flaky = task("flaky", "build", 0);
    flaky.max_retries = 1;
    repo.insert_tasks(&[flaky]).await?;

    repo.claim_next("w", &any_capability()).await?;
    repo.transition("flaky", TaskStatus::Running, None).await?;
    let first = repo.transition("flaky", TaskStatus::Failed, None).await?;
    assert_eq!(first.task().status, TaskStatus::Queued);
    assert_eq!(first.task().retry_count, 1);
    assert!(first.task().assignee.is_none());

    repo.claim_next("w", &any_capability()).await?;
    repo.transition("flaky", TaskStatus::Running, None).await?;
    let second = repo.transition("flaky", TaskStatus::Failed, None).await?;
    assert_eq!(second.task().status, TaskStatus::Failed);
    assert_eq!(second.task().retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_batch_transition_is_all_or_nothing() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[task("a", "build", 0), task("b", "build", 0)])
        .await?;
    repo.claim_next("w", &any_capability()).await?;

    // 只有一个任务处于 assigned，批量进入 running 必须整体失败
    let result = repo
        .transition_batch(&["a".to_string(), "b".to_string()], TaskStatus::Running)
        .await;
    assert!(result.is_err());
    let counts = repo.status_counts().await?;
    assert_eq!(counts.running, 0);
    assert_eq!(counts.assigned, 1);

    let cancelled = repo
        .transition_batch(&["a".to_string(), "b".to_string()], TaskStatus::Cancelled)
        .await?;
    assert_eq!(cancelled.len(), 2);
    assert_eq!(repo.status_counts().await?.cancelled, 2);
    Ok(())
}

#[tokio::test]
async fn test_cancel_outcomes() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[task("queued", "build", 0), task("running", "build", 9)])
        .await?;
    repo.claim_next("w", &any_capability()).await?;
    repo.transition("running", TaskStatus::Running, None).await?;

    assert!(matches!(
        repo.request_cancel("queued").await?,
        CancelOutcome::Cancelled(_)
    ));
    match repo.request_cancel("running").await? {
        CancelOutcome::Flagged(task) => {
            assert!(task.cancel_requested);
            assert_eq!(task.status, TaskStatus::Running);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(matches!(
        repo.request_cancel("queued").await?,
        CancelOutcome::AlreadyFinished(_)
    ));

    // 已请求取消的任务失败时不再重试
    let failed = repo.transition("running", TaskStatus::Failed, None).await?;
    assert_eq!(failed.task().status, TaskStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_reclaim_and_release() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_tasks(&[task("a", "build", 2), task("b", "build", 1)])
        .await?;
    repo.claim_next("dead", &any_capability()).await?;
    repo.transition("a", TaskStatus::Running, None).await?;
    repo.claim_next("dead", &any_capability()).await?;

    assert!(repo.release("b", "someone-else").await?.is_none());

    let reclaimed = repo.reclaim_worker_tasks("dead").await?;
    let ids: HashSet<String> = reclaimed.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, HashSet::from(["a".to_string(), "b".to_string()]));
    assert!(reclaimed
        .iter()
        .all(|t| t.status == TaskStatus::Queued && t.assignee.is_none()));

    repo.claim_next("alive", &any_capability()).await?;
    let released = repo.release("a", "alive").await?.expect("released");
    assert_eq!(released.status, TaskStatus::Queued);
    Ok(())
}

#[tokio::test]
async fn test_mark_plan_finished_only_once() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteTaskRepository::new(test_db.db.clone());
    repo.insert_plan(&plan("p"), &[plan_task("p", "p:a", "build")], &[])
        .await?;

    assert!(repo.mark_plan_finished("p").await?);
    assert!(!repo.mark_plan_finished("p").await?);
    assert!(repo.get_plan("p").await?.expect("plan").finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_worker_registration_and_liveness() -> Result<()> {
    let test_db = TestDatabase::new().await?;
    let repo = SqliteWorkerRepository::new(test_db.db.clone());

    let worker = repo
        .upsert("w1", &["build".to_string(), "test".to_string()])
        .await?;
    assert_eq!(worker.status, WorkerStatus::Idle);
    repo.upsert("w2", &["*".to_string()]).await?;
    repo.upsert("w3", &["deploy".to_string()]).await?;

    let missing = repo.heartbeat("ghost", WorkerStatus::Active).await;
    assert!(matches!(missing, Err(OrchestratorError::WorkerNotFound { .. })));

    let live_since = Utc::now() - chrono::Duration::seconds(30);
    let builders: HashSet<String> = repo
        .list_active(Some("build"), live_since)
        .await?
        .into_iter()
        .map(|w| w.id)
        .collect();
    assert_eq!(builders, HashSet::from(["w1".to_string(), "w2".to_string()]));
    assert_eq!(repo.list_active(None, live_since).await?.len(), 3);

    repo.set_current_task("w1", Some("task-1")).await?;
    let busy = repo.get("w1").await?.expect("w1");
    assert_eq!(busy.status, WorkerStatus::Active);
    assert_eq!(busy.current_task_id.as_deref(), Some("task-1"));

    let stale = repo
        .mark_stale_offline(Utc::now() + chrono::Duration::seconds(1))
        .await?;
    assert_eq!(stale.len(), 3);
    assert!(stale.iter().all(|w| w.status == WorkerStatus::Offline));
    assert!(repo.list_active(None, live_since).await?.is_empty());

    // 重新注册会复活 offline 的 Worker
    let revived = repo.upsert("w1", &["build".to_string()]).await?;
    assert_eq!(revived.status, WorkerStatus::Idle);
    assert!(revived.current_task_id.is_none());

    let counts = repo.count_by_status().await?;
    assert!(counts.contains(&(WorkerStatus::Offline, 2)));
    assert!(counts.contains(&(WorkerStatus::Idle, 1)));
    Ok(())
}
