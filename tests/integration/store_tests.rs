use super::common::*;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use planwright::approval::AutoApprove;
use planwright::persistence::{MemoryStore, PlanStore, SqliteStore};
use planwright::planning::{Plan, PlanStatus, Step, StepStatus, Task, TaskStatus};
use planwright::EngineError;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn approved(task_id: &str, version: u32) -> Plan {
    let mut plan = Plan::new(task_id, version, "goal").with_steps(vec![Step::new("s", "S")]);
    plan.transition(PlanStatus::Approved).unwrap();
    plan
}

/// Behaviour both stores must share
async fn check_store_contract(store: Arc<dyn PlanStore>) {
    assert_ok!(store.insert_task(&Task::new("t", "contract")).await);
    assert_err!(store.insert_task(&Task::new("t", "again")).await);

    let v1 = approved("t", 1);
    let v2 = approved("t", 2).with_parent(&v1.id);
    assert_ok!(store.insert_plan(&v1).await);
    assert_ok!(store.insert_plan(&v2).await);
    // versions only grow
    assert_err!(store.insert_plan(&approved("t", 2)).await);
    assert_err!(store.insert_plan(&approved("t", 0)).await);

    let claimed = store.claim_execution(&v1.id).await.unwrap();
    assert_eq!(claimed.status, PlanStatus::Executing);
    assert!(matches!(
        store.claim_execution(&v2.id).await,
        Err(EngineError::ExecutionConflict { .. })
    ));
    // a plan is never claimed twice
    assert!(store.claim_execution(&v1.id).await.is_err());

    let mut paused = claimed;
    paused.transition(PlanStatus::Paused).unwrap();
    assert_ok!(store.update_plan(&paused).await);
    assert!(store.claim_execution(&v2.id).await.is_err());

    let mut done = paused;
    done.transition(PlanStatus::Executing).unwrap();
    done.transition(PlanStatus::Completed).unwrap();
    assert_ok!(store.update_plan(&done).await);
    // terminal plans are never rewritten
    assert_err!(store.update_plan(&done).await);

    assert_ok!(store.claim_execution(&v2.id).await);
    let latest = store.latest_plan("t").await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.parent_plan_id.as_deref(), Some(v1.id.as_str()));
}

#[tokio::test]
async fn test_memory_store_contract() {
    check_store_contract(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
    check_store_contract(Arc::new(SqliteStore::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn test_replanned_task_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.child("state").child("planwright.db");

    {
        let store: Arc<dyn PlanStore> = Arc::new(SqliteStore::open(db.path()).await.unwrap());
        let harness = Harness::with_store(
            fast_config(),
            store,
            ScriptedDecomposer::new(vec![
                body("ship", vec![action("a", &[]), action("b", &["a"])]),
                body("ship again", vec![action("a", &[]), action("b2", &["a"])]),
            ]),
            ScriptedActor::new().failing("b", "Out of memory"),
            Arc::new(AutoApprove),
        );
        let task = harness
            .coordinator
            .submit_task(Task::new("task-db", "ship"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    assert!(db.path().exists());
    let store = SqliteStore::open(db.path()).await.unwrap();

    let task = store.require_task("task-db").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.replan_attempts, 1);
    assert_eq!(task.failure_history.len(), 1);

    let versions = store.plan_versions("task-db").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].status, PlanStatus::Failed);
    assert!(versions[0].error.as_deref().unwrap().contains("Out of memory"));
    assert_eq!(versions[1].status, PlanStatus::Completed);
    assert_eq!(versions[1].step("a").unwrap().status, StepStatus::Completed);

    // a, b (failed), b2
    let stats = store.recent_actor_stats("scripted", 30).await.unwrap();
    assert_eq!(stats.total_executions, 3);
    assert_eq!(stats.successful_executions, 2);
    assert_eq!(stats.recent_executions, 3);
}
