//! Persistence capability
//!
//! The store is the single source of truth for task, plan and step status.
//! Two guarantees matter to the engine:
//! - plan versions per task only ever increase, and terminal plans are never rewritten
//! - [`PlanStore::claim_execution`] hands "executing" responsibility for a task
//!   to exactly one plan at a time

mod db;
mod memory;

pub use db::SqliteStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ActorStats;
use crate::error::{EngineError, EngineResult};
use crate::planning::types::{Plan, PlanStatus, Task};

/// One actor invocation outcome; feeds trust scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorExecution {
    pub actor_id: String,
    pub plan_id: String,
    pub step_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Store a new plan version; its version must exceed every stored version of the task
    async fn insert_plan(&self, plan: &Plan) -> Result<()>;
    /// Overwrite a non-terminal plan
    async fn update_plan(&self, plan: &Plan) -> Result<()>;
    async fn get_plan(&self, id: &str) -> Result<Option<Plan>>;
    /// Every version of a task's plan, oldest first
    async fn plan_versions(&self, task_id: &str) -> Result<Vec<Plan>>;

    /// Atomically move an `approved` plan to `executing`.
    ///
    /// Fails with [`EngineError::ExecutionConflict`] if the plan is not
    /// approved or another plan of the same task is executing or paused.
    async fn claim_execution(&self, plan_id: &str) -> EngineResult<Plan>;

    async fn record_actor_execution(&self, execution: &ActorExecution) -> Result<()>;
    /// History of one actor, with the recent window starting at `since`
    async fn actor_stats(&self, actor_id: &str, since: DateTime<Utc>) -> Result<ActorStats>;

    /// [`PlanStore::actor_stats`] with a recent window of `window_days` ending now
    async fn recent_actor_stats(&self, actor_id: &str, window_days: i64) -> Result<ActorStats> {
        self.actor_stats(actor_id, Utc::now() - chrono::Duration::days(window_days))
            .await
    }

    async fn latest_plan(&self, task_id: &str) -> Result<Option<Plan>> {
        Ok(self.plan_versions(task_id).await?.pop())
    }

    async fn require_task(&self, id: &str) -> EngineResult<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| EngineError::task_not_found(id))
    }

    async fn require_plan(&self, id: &str) -> EngineResult<Plan> {
        self.get_plan(id)
            .await?
            .ok_or_else(|| EngineError::plan_not_found(id))
    }
}

/// Shared checks for `insert_plan`
pub(crate) fn check_new_version(plan: &Plan, latest: Option<u32>) -> Result<()> {
    if plan.version == 0 {
        anyhow::bail!("plan {} has version 0; versions start at 1", plan.id);
    }
    if let Some(latest) = latest {
        if plan.version <= latest {
            anyhow::bail!(
                "plan version {} for task {} is not greater than stored version {}",
                plan.version,
                plan.task_id,
                latest
            );
        }
    }
    Ok(())
}

/// Shared checks for `update_plan`
pub(crate) fn check_mutable(stored: &Plan) -> Result<()> {
    if stored.status.is_terminal() {
        return Err(EngineError::InvalidTransition {
            entity: "plan",
            id: stored.id.clone(),
            from: stored.status.to_string(),
            to: "modified".to_string(),
        }
        .into());
    }
    Ok(())
}

/// A paused plan keeps its claim
pub(crate) fn holds_execution(status: PlanStatus) -> bool {
    matches!(status, PlanStatus::Executing | PlanStatus::Paused)
}

/// Shared checks for `claim_execution`; returns the claimed plan
pub(crate) fn claim(stored: &Plan, siblings: &[Plan]) -> EngineResult<Plan> {
    if let Some(other) = siblings
        .iter()
        .find(|p| p.id != stored.id && holds_execution(p.status))
    {
        return Err(EngineError::ExecutionConflict {
            plan_id: stored.id.clone(),
            reason: format!("plan {} (v{}) is already executing", other.id, other.version),
        });
    }
    if stored.status != PlanStatus::Approved {
        return Err(EngineError::ExecutionConflict {
            plan_id: stored.id.clone(),
            reason: format!("plan is {}, not approved", stored.status),
        });
    }
    let mut claimed = stored.clone();
    claimed.transition(PlanStatus::Executing)?;
    Ok(claimed)
}

pub(crate) fn stats_from(executions: &[&ActorExecution], since: DateTime<Utc>) -> ActorStats {
    let mut stats = ActorStats::default();
    for e in executions {
        stats.total_executions += 1;
        if e.success {
            stats.successful_executions += 1;
        }
        if e.executed_at >= since {
            stats.recent_executions += 1;
            if e.success {
                stats.recent_successes += 1;
            }
        }
    }
    stats
}
