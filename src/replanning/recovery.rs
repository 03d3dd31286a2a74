use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use super::Coordinator;
use crate::classifier::{ClassifiedError, Severity};
use crate::decomposer::{CompletedStep, DecompositionContext, ReplanContext};
use crate::error::{EngineError, EngineResult};
use crate::planning::types::{context_keys, Plan, PlanEvent, Step, StepStatus, Task, TaskStatus};

impl Coordinator {
    /// Decide what follows a failed plan.
    ///
    /// - `Ok(None)`: the failure does not warrant replanning; the task is failed.
    /// - `Ok(Some(plan))`: the next version, stored as a draft and not yet gated.
    /// - `Err(RequiresHumanIntervention)`: attempts are exhausted or failures
    ///   keep repeating; the task waits in `requires_human`.
    ///
    /// While a replacement is produced the task sits in `replanning` rather
    /// than `failed`; `failed` is kept for tasks that will not run again.
    ///
    /// A step's first timeout is MEDIUM and would not replan on its own. It
    /// gets one replan so that a repeat is seen, classified CRITICAL, and
    /// recovered or escalated through the same bounds.
    ///
    /// Attempt counters live on the task so they span plan versions.
    pub async fn handle_plan_failure(
        &self,
        task: &mut Task,
        plan: &Plan,
        error: &ClassifiedError,
    ) -> EngineResult<Option<Plan>> {
        task.record_failure(plan, error);
        task.consecutive_failures += 1;

        if !error.requires_replanning && !is_first_timeout(error) {
            tracing::info!("Plan {} failed with {}; not replanning", plan.id, error);
            task.set_status(TaskStatus::Failed);
            self.store.update_task(task).await?;
            return Ok(None);
        }
        if is_first_timeout(error) {
            tracing::info!(
                "Step {} of plan {} timed out for the first time; replanning once",
                error.context.step_id.as_deref().unwrap_or("?"),
                plan.id
            );
        }

        self.replan(task, plan, error).await.map(Some)
    }

    /// Produce and store the version after `plan`, within the task's bounds.
    ///
    /// Each try counts as an attempt and waits out the minimum interval
    /// since the previous one. A try that fails or times out counts as a
    /// consecutive failure, and the bounds are checked again before the next.
    pub(super) async fn replan(
        &self,
        task: &mut Task,
        plan: &Plan,
        error: &ClassifiedError,
    ) -> EngineResult<Plan> {
        loop {
            if let Some(reason) = self.escalation_reason(task) {
                return Err(self.escalate(task, reason, error).await);
            }

            task.set_status(TaskStatus::Replanning);
            self.store.update_task(task).await?;
            self.wait_min_interval(task).await;

            task.replan_attempts += 1;
            task.last_replan_at = Some(Utc::now());
            self.store.update_task(task).await?;
            let attempt = task.replan_attempts;

            tracing::info!(
                "Replanning task {} after plan v{} failed (attempt {}/{}): {}",
                task.id,
                plan.version,
                attempt,
                self.config.max_attempts,
                error
            );
            self.emit(PlanEvent::ReplanTriggered {
                task_id: task.id.clone(),
                failed_plan_id: plan.id.clone(),
                attempt,
            });

            match self.next_plan(task, plan, error, attempt).await {
                Ok(next) => {
                    self.store_plan(&next).await?;
                    return Ok(next);
                }
                Err(e) => {
                    tracing::warn!(
                        "Replanning attempt {} for task {} failed: {}",
                        attempt,
                        task.id,
                        e
                    );
                    task.consecutive_failures += 1;
                }
            }
        }
    }

    /// Build the version after `previous`, carrying its completed steps forward
    async fn next_plan(
        &self,
        task: &Task,
        previous: &Plan,
        error: &ClassifiedError,
        attempt: u32,
    ) -> EngineResult<Plan> {
        let replan = replan_context(task, previous, error, attempt);
        let completed = replan.completed_steps.clone();
        let context = DecompositionContext::new(&task.id).with_replan(replan);

        let limit = self.config.attempt_timeout();
        let mut next = tokio::time::timeout(
            limit,
            self.generate(task, previous.version + 1, &context),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            duration_secs: limit.as_secs(),
        })??;

        next.parent_plan_id = Some(previous.id.clone());
        carry_forward(previous, &mut next);

        next.context.insert(
            context_keys::ERROR_ANALYSIS.to_string(),
            serde_json::to_value(error).unwrap_or(Value::Null),
        );
        next.context.insert(
            context_keys::COMPLETED_STEPS.to_string(),
            serde_json::to_value(&completed).unwrap_or(Value::Null),
        );
        next.context.insert(
            context_keys::FAILURE_HISTORY.to_string(),
            serde_json::to_value(&task.failure_history).unwrap_or(Value::Null),
        );
        next.context.insert(
            context_keys::PREVIOUS_PLAN.to_string(),
            json!({
                "id": previous.id,
                "version": previous.version,
                "goal": previous.goal,
                "error": previous.error,
            }),
        );

        tracing::info!(
            "Task {} plan v{} created from v{} ({} steps, {} carried over)",
            task.id,
            next.version,
            previous.version,
            next.steps.len(),
            next.completed_count()
        );
        Ok(next)
    }

    fn escalation_reason(&self, task: &Task) -> Option<String> {
        if task.replan_attempts >= self.config.max_attempts {
            Some(format!(
                "replanning attempts exhausted ({}/{})",
                task.replan_attempts, self.config.max_attempts
            ))
        } else if task.consecutive_failures >= self.config.escalation_threshold {
            Some(format!(
                "{} consecutive failures without success",
                task.consecutive_failures
            ))
        } else {
            None
        }
    }

    async fn escalate(&self, task: &mut Task, reason: String, error: &ClassifiedError) -> EngineError {
        task.intervention_reason = Some(reason.clone());
        task.set_status(TaskStatus::RequiresHuman);
        if let Err(e) = self.store.update_task(task).await {
            return EngineError::from_anyhow(e);
        }

        tracing::warn!("Task {} requires human intervention: {}", task.id, reason);
        self.emit(PlanEvent::HumanInterventionRequired {
            task_id: task.id.clone(),
            reason: reason.clone(),
        });

        EngineError::RequiresHumanIntervention {
            task_id: task.id.clone(),
            reason,
            last_error: Some(Box::new(error.clone())),
        }
    }

    async fn wait_min_interval(&self, task: &Task) {
        let Some(last) = task.last_replan_at else {
            return;
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
        let min = self.config.min_interval();
        if elapsed < min {
            let wait = min - elapsed;
            tracing::debug!("Waiting {:?} before replanning task {}", wait, task.id);
            tokio::time::sleep(wait).await;
        }
    }
}

/// A timeout classified before any earlier timeout of the same step
fn is_first_timeout(error: &ClassifiedError) -> bool {
    error.is_timeout() && error.severity < Severity::High
}

/// Everything the decomposer gets to revise a failed plan
pub fn replan_context(
    task: &Task,
    previous: &Plan,
    error: &ClassifiedError,
    attempt: u32,
) -> ReplanContext {
    ReplanContext {
        attempt,
        error: error.clone(),
        completed_steps: previous
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| CompletedStep {
                id: s.id.clone(),
                description: s.description.clone(),
                result: s.result.clone(),
            })
            .collect(),
        failure_history: task.failure_history.clone(),
        previous_plan_id: previous.id.clone(),
        previous_version: previous.version,
        previous_goal: previous.goal.clone(),
    }
}

/// Mark steps already completed in `previous` as completed in `next`.
///
/// Steps are matched by id. Completed steps the new plan leaves out but
/// still depends on (directly or through other restored steps) are put back
/// at the front, in their original order.
pub fn carry_forward(previous: &Plan, next: &mut Plan) {
    let completed: HashMap<&str, &Step> = previous
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| (s.id.as_str(), s))
        .collect();

    for step in next.steps.iter_mut() {
        if let Some(done) = completed.get(step.id.as_str()) {
            step.status = StepStatus::Completed;
            step.result = done.result.clone();
            step.error = None;
            step.actual_duration_ms = done.actual_duration_ms;
        }
    }

    let mut present: HashSet<String> = next.steps.iter().map(|s| s.id.clone()).collect();
    let mut wanted: Vec<String> = next
        .steps
        .iter()
        .flat_map(|s| s.dependencies.iter().cloned())
        .collect();
    let mut restore = HashSet::new();
    while let Some(id) = wanted.pop() {
        if present.contains(&id) {
            continue;
        }
        if let Some(done) = completed.get(id.as_str()) {
            wanted.extend(done.dependencies.iter().cloned());
            present.insert(id.clone());
            restore.insert(id);
        }
    }

    if restore.is_empty() {
        return;
    }
    let mut steps: Vec<Step> = previous
        .steps
        .iter()
        .filter(|s| restore.contains(&s.id))
        .cloned()
        .collect();
    steps.append(&mut next.steps);
    next.steps = steps;
}
