use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{check_mutable, check_new_version, claim, stats_from, ActorExecution, PlanStore};
use crate::approval::ActorStats;
use crate::error::{EngineError, EngineResult};
use crate::planning::types::{Plan, Task};

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    plans: HashMap<String, Plan>,
    executions: Vec<ActorExecution>,
}

impl Inner {
    fn versions(&self, task_id: &str) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .values()
            .filter(|p| p.task_id == task_id)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.version);
        plans
    }
}

/// Process-local store. A single write lock makes every operation atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            anyhow::bail!("task {} already exists", task.id);
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(EngineError::task_not_found(&task.id).into()),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.inner.read().await.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&plan.task_id) {
            return Err(EngineError::task_not_found(&plan.task_id).into());
        }
        let latest = inner.versions(&plan.task_id).last().map(|p| p.version);
        check_new_version(plan, latest)?;
        inner.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .plans
            .get_mut(&plan.id)
            .ok_or_else(|| EngineError::plan_not_found(&plan.id))?;
        check_mutable(stored)?;
        *stored = plan.clone();
        Ok(())
    }

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        Ok(self.inner.read().await.plans.get(id).cloned())
    }

    async fn plan_versions(&self, task_id: &str) -> Result<Vec<Plan>> {
        Ok(self.inner.read().await.versions(task_id))
    }

    async fn claim_execution(&self, plan_id: &str) -> EngineResult<Plan> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| EngineError::plan_not_found(plan_id))?;
        let siblings = inner.versions(&stored.task_id);
        let claimed = claim(&stored, &siblings)?;
        inner.plans.insert(claimed.id.clone(), claimed.clone());
        Ok(claimed)
    }

    async fn record_actor_execution(&self, execution: &ActorExecution) -> Result<()> {
        self.inner.write().await.executions.push(execution.clone());
        Ok(())
    }

    async fn actor_stats(&self, actor_id: &str, since: DateTime<Utc>) -> Result<ActorStats> {
        let inner = self.inner.read().await;
        let mine: Vec<&ActorExecution> = inner
            .executions
            .iter()
            .filter(|e| e.actor_id == actor_id)
            .collect();
        Ok(stats_from(&mine, since))
    }
}
