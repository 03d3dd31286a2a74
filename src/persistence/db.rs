use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;

use super::{check_mutable, check_new_version, claim, ActorExecution, PlanStore};
use crate::approval::ActorStats;
use crate::error::{EngineError, EngineResult};
use crate::planning::types::{Plan, PlanStatus, Task};

/// SQLite-backed store.
///
/// Entities are stored as JSON documents next to the columns the engine
/// queries on (status, task, version).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // ?mode=rwc creates the file if it doesn't exist
        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .with_context(|| format!("Failed to connect to database {}", path.display()))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database (one connection, so every query sees the same data)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                version INTEGER NOT NULL,
                parent_plan_id TEXT,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (task_id, version)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS actor_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor_id TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                error TEXT,
                executed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_actor_executions_actor
            ON actor_executions(actor_id, executed_at)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn latest_version(&self, task_id: &str) -> Result<Option<u32>> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT MAX(version) FROM plans WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.map(|v| v as u32))
    }
}

fn decode_plan(data: &str) -> Result<Plan> {
    serde_json::from_str(data).context("Invalid plan document")
}

fn decode_task(data: &str) -> Result<Task> {
    serde_json::from_str(data).context("Invalid task document")
}

#[async_trait]
impl PlanStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, status, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(serde_json::to_string(task)?)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert task {}", task.id))?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, data = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(serde_json::to_string(task)?)
        .bind(task.updated_at.to_rfc3339())
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::task_not_found(&task.id).into());
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT data FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(data,)| decode_task(&data)).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT data FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|(data,)| decode_task(data)).collect()
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        check_new_version(plan, self.latest_version(&plan.task_id).await?)?;

        // UNIQUE(task_id, version) catches a concurrent insert of the same version
        sqlx::query(
            r#"
            INSERT INTO plans (id, task_id, version, parent_plan_id, status, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.task_id)
        .bind(plan.version as i64)
        .bind(&plan.parent_plan_id)
        .bind(plan.status.as_str())
        .bind(serde_json::to_string(plan)?)
        .bind(plan.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert plan {} v{}", plan.id, plan.version))?;
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> Result<()> {
        let stored = self
            .get_plan(&plan.id)
            .await?
            .ok_or_else(|| EngineError::plan_not_found(&plan.id))?;
        check_mutable(&stored)?;

        // Guard against a concurrent terminal write between read and update
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET status = ?, data = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(plan.status.as_str())
        .bind(serde_json::to_string(plan)?)
        .bind(&plan.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("plan {} became terminal before the update", plan.id);
        }
        Ok(())
    }

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT data FROM plans WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(data,)| decode_plan(&data)).transpose()
    }

    async fn plan_versions(&self, task_id: &str) -> Result<Vec<Plan>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT data FROM plans WHERE task_id = ? ORDER BY version ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|(data,)| decode_plan(data)).collect()
    }

    async fn claim_execution(&self, plan_id: &str) -> EngineResult<Plan> {
        let stored = self.require_plan(plan_id).await?;
        let siblings = self.plan_versions(&stored.task_id).await?;
        let claimed = claim(&stored, &siblings)?;

        // Single conditional statement: only one claimant can win the race
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET status = ?, data = ?
            WHERE id = ?
              AND status = ?
              AND NOT EXISTS (
                  SELECT 1 FROM plans other
                  WHERE other.task_id = ? AND other.id != ? AND other.status IN (?, ?)
              )
            "#,
        )
        .bind(PlanStatus::Executing.as_str())
        .bind(serde_json::to_string(&claimed).map_err(anyhow::Error::from)?)
        .bind(plan_id)
        .bind(PlanStatus::Approved.as_str())
        .bind(&stored.task_id)
        .bind(plan_id)
        .bind(PlanStatus::Executing.as_str())
        .bind(PlanStatus::Paused.as_str())
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ExecutionConflict {
                plan_id: plan_id.to_string(),
                reason: "lost the execution claim to a concurrent caller".to_string(),
            });
        }
        Ok(claimed)
    }

    async fn record_actor_execution(&self, execution: &ActorExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actor_executions
                (actor_id, plan_id, step_id, success, duration_ms, error, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.actor_id)
        .bind(&execution.plan_id)
        .bind(&execution.step_id)
        .bind(execution.success)
        .bind(execution.duration_ms as i64)
        .bind(&execution.error)
        .bind(execution.executed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn actor_stats(&self, actor_id: &str, since: DateTime<Utc>) -> Result<ActorStats> {
        let row = sqlx::query_as::<_, (i64, Option<i64>, Option<i64>, Option<i64>)>(
            r#"
            SELECT
                COUNT(*),
                SUM(success),
                SUM(CASE WHEN executed_at >= ? THEN 1 ELSE 0 END),
                SUM(CASE WHEN executed_at >= ? AND success = 1 THEN 1 ELSE 0 END)
            FROM actor_executions
            WHERE actor_id = ?
            "#,
        )
        .bind(since.timestamp_millis())
        .bind(since.timestamp_millis())
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ActorStats {
            total_executions: row.0 as u64,
            successful_executions: row.1.unwrap_or(0) as u64,
            recent_executions: row.2.unwrap_or(0) as u64,
            recent_successes: row.3.unwrap_or(0) as u64,
        })
    }
}
