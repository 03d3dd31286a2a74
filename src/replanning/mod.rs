//! Replanning loop and task coordinator
//!
//! The coordinator is the only component that talks to all the others:
//! planner, approval gate, executor and store. A task moves through
//! planning, gating and execution; a qualifying failure goes through
//! [`Coordinator::handle_plan_failure`] which produces the next plan
//! version, and the loop starts over at the gate.

mod recovery;

pub use recovery::{carry_forward, replan_context};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::actors::ActorInvoker;
use crate::approval::{
    deciding_actor, ActorStats, ApprovalGate, ApprovalRequest, ApprovalService, ApprovalVerdict,
    UNASSIGNED_ACTOR,
};
use crate::classifier::{ErrorClassifier, ErrorContext};
use crate::config::{Config, ReplanningConfig};
use crate::decomposer::{Decomposer, DecompositionContext};
use crate::error::{EngineError, EngineResult};
use crate::evaluator::PlanEvaluator;
use crate::executor::{CancelHandle, PlanExecutor};
use crate::persistence::PlanStore;
use crate::planning::types::{context_keys, Plan, PlanEvent, PlanStatus, Task, TaskStatus};
use crate::planning::Planner;

/// What a human decides for a task that requires intervention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    /// Reset the replanning counters and try again; the next plan needs human approval
    Retry,
    /// Give up on the task
    Abandon,
}

/// Query view of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: Task,
    /// Latest plan version
    pub current_plan: Option<Plan>,
    pub progress_percent: f32,
    /// Every plan version, oldest first
    pub versions: Vec<Plan>,
}

pub struct Coordinator {
    config: ReplanningConfig,
    store: Arc<dyn PlanStore>,
    classifier: ErrorClassifier,
    gate: ApprovalGate,
    planner: Planner,
    executor: PlanExecutor,
    approvals: Arc<dyn ApprovalService>,
    event_tx: mpsc::UnboundedSender<PlanEvent>,
    /// Control handles of plans currently executing, by task id
    running: Mutex<HashMap<String, CancelHandle>>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        store: Arc<dyn PlanStore>,
        decomposer: Arc<dyn Decomposer>,
        actors: Arc<dyn ActorInvoker>,
        approvals: Arc<dyn ApprovalService>,
        event_tx: mpsc::UnboundedSender<PlanEvent>,
    ) -> Self {
        let classifier = ErrorClassifier::new(config.classifier.clone());
        let gate = ApprovalGate::new(config.approval.clone());
        let evaluator = PlanEvaluator::new(config.evaluator.clone(), gate.clone());
        let executor = PlanExecutor::new(
            config.executor.clone(),
            classifier.clone(),
            gate.clone(),
            store.clone(),
            actors,
            approvals.clone(),
            event_tx.clone(),
        );

        Self {
            config: config.replanning.clone(),
            store,
            classifier,
            gate,
            planner: Planner::new(decomposer, evaluator),
            executor,
            approvals,
            event_tx,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Plan, gate and execute a new task until it completes, fails for good,
    /// is cancelled or needs a human.
    ///
    /// Escalation is returned as [`EngineError::RequiresHumanIntervention`];
    /// the task is then left in `requires_human` until
    /// [`Coordinator::resolve_intervention`] is called.
    pub async fn submit_task(&self, mut task: Task) -> EngineResult<Task> {
        task.set_status(TaskStatus::Planning);
        self.store.insert_task(&task).await?;
        tracing::info!("Task {} submitted: {}", task.id, task.description);

        let context = DecompositionContext::new(&task.id);
        let plan = match self.generate(&task, 1, &context).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("Planning failed for task {}: {}", task.id, e);
                task.set_status(TaskStatus::Failed);
                self.store.update_task(&task).await?;
                return Err(e);
            }
        };
        self.store_plan(&plan).await?;

        self.drive(task, plan).await
    }

    /// Gate, execute, and recover until the task settles.
    ///
    /// The task's control handle is registered for the whole drive, so a
    /// cancel reaches a plan waiting for approval as well as a running one.
    /// An internal error fails the task before it is returned.
    async fn drive(&self, mut task: Task, plan: Plan) -> EngineResult<Task> {
        let cancel = self.register(&task.id);
        let result = self.drive_plans(&mut task, plan, &cancel).await;
        self.unregister(&task.id);

        match result {
            Ok(()) => Ok(task),
            Err(e) if e.requires_human() => Err(e),
            Err(e) => {
                tracing::error!("Task {} failed: {}", task.id, e);
                if !task.status.is_terminal() {
                    task.set_status(TaskStatus::Failed);
                    if let Err(write) = self.store.update_task(&task).await {
                        tracing::warn!("Failed to record failure of task {}: {:#}", task.id, write);
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive_plans(
        &self,
        task: &mut Task,
        mut plan: Plan,
        cancel: &CancelHandle,
    ) -> EngineResult<()> {
        loop {
            if !self.gate_plan(task, &mut plan, cancel).await? {
                task.set_status(TaskStatus::Cancelled);
                self.store.update_task(task).await?;
                tracing::info!("Task {} cancelled: plan v{} not approved", task.id, plan.version);
                return Ok(());
            }

            task.set_status(TaskStatus::Executing);
            self.store.update_task(task).await?;

            let outcome = self.executor.execute_plan(&plan, task, cancel).await?;
            for step_id in &outcome.timed_out_steps {
                task.record_timeout(step_id);
            }

            match outcome.status() {
                PlanStatus::Completed => {
                    task.consecutive_failures = 0;
                    task.set_status(TaskStatus::Completed);
                    self.store.update_task(task).await?;
                    tracing::info!("Task {} completed with plan v{}", task.id, plan.version);
                    return Ok(());
                }
                PlanStatus::Cancelled => {
                    task.set_status(TaskStatus::Cancelled);
                    self.store.update_task(task).await?;
                    return Ok(());
                }
                _ => {
                    let error = outcome.error.clone().unwrap_or_else(|| {
                        self.classifier.classify(
                            outcome.plan.error.as_deref().unwrap_or("Plan failed"),
                            ErrorContext::for_plan(&outcome.plan.id)
                                .with_attempt(task.replan_attempts + 1),
                        )
                    });
                    match self.handle_plan_failure(task, &outcome.plan, &error).await? {
                        Some(next) => plan = next,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Run a draft plan through the approval gate.
    ///
    /// Returns false if the plan was not approved: rejected by a human, not
    /// answered within the approval wait limit, or cancelled while waiting.
    /// The plan is then cancelled.
    async fn gate_plan(
        &self,
        task: &mut Task,
        plan: &mut Plan,
        cancel: &CancelHandle,
    ) -> EngineResult<bool> {
        let window = self.gate.config().recent_window_days;
        let mut stats: HashMap<String, ActorStats> = HashMap::new();
        let mut actor_ids: Vec<String> = plan.actors().iter().map(|a| a.id.clone()).collect();
        if actor_ids.is_empty() {
            actor_ids.push(UNASSIGNED_ACTOR.to_string());
        }
        for id in actor_ids {
            let history = self.store.recent_actor_stats(&id, window).await?;
            stats.insert(id, history);
        }

        let (actor_id, actor_stats) =
            deciding_actor(plan, |id| stats.get(id).copied().unwrap_or_default());
        let decision = if task.force_approval {
            self.gate.forced(plan, &actor_id, &actor_stats)
        } else {
            self.gate.should_require_approval(
                plan,
                &actor_id,
                &actor_stats,
                None,
                task.autonomy_level,
            )
        };
        plan.context
            .insert(context_keys::APPROVAL.to_string(), decision.to_value());

        if !decision.requires_approval {
            plan.transition(PlanStatus::Approved)?;
            self.store.update_plan(plan).await?;
            return Ok(true);
        }

        plan.transition(PlanStatus::PendingApproval)?;
        self.store.update_plan(plan).await?;
        task.set_status(TaskStatus::AwaitingApproval);
        self.store.update_task(task).await?;

        let request = ApprovalRequest {
            task_id: task.id.clone(),
            plan_id: plan.id.clone(),
            plan_version: plan.version,
            step_id: None,
            summary: format!("{} ({} steps)", plan.goal, plan.steps.len()),
            decision: Some(decision),
        };
        let approval_id = self
            .approvals
            .request_approval(request)
            .await
            .context("Failed to request plan approval")?;
        tracing::info!("Plan {} v{} awaiting approval {}", plan.id, plan.version, approval_id);
        self.emit(PlanEvent::ApprovalRequested {
            plan_id: plan.id.clone(),
            step_id: None,
            approval_id: approval_id.clone(),
        });

        let executor = self.executor.config();
        let limit = executor.approval_wait_timeout();
        let wait = async {
            let decision = self.approvals.await_decision(&approval_id);
            match limit {
                Some(limit) => tokio::time::timeout(limit, decision).await.ok(),
                None => Some(decision.await),
            }
        };
        let verdict = tokio::select! {
            verdict = wait => verdict,
            _ = cancel.cancelled(executor.cancel_poll_interval()) => {
                self.withdraw(plan, "Cancelled while awaiting approval".to_string())
                    .await?;
                return Ok(false);
            }
        };
        let verdict = match verdict {
            Some(verdict) => verdict.context("Failed waiting for plan approval")?,
            None => {
                let secs = limit.map(|l| l.as_secs()).unwrap_or_default();
                self.withdraw(plan, format!("Approval wait timed out after {}s", secs))
                    .await?;
                return Ok(false);
            }
        };
        self.emit(PlanEvent::ApprovalResolved {
            plan_id: plan.id.clone(),
            step_id: None,
            approved: verdict.is_approved(),
        });

        match verdict {
            ApprovalVerdict::Approved => {
                plan.transition(PlanStatus::Approved)?;
                self.store.update_plan(plan).await?;
                if task.force_approval {
                    task.force_approval = false;
                    self.store.update_task(task).await?;
                }
                Ok(true)
            }
            ApprovalVerdict::Rejected { reason } => {
                let message = match reason {
                    Some(reason) => format!("Rejected by reviewer: {}", reason),
                    None => "Rejected by reviewer".to_string(),
                };
                self.withdraw(plan, message).await?;
                Ok(false)
            }
        }
    }

    /// Cancel a plan that never started executing
    async fn withdraw(&self, plan: &mut Plan, reason: String) -> EngineResult<()> {
        tracing::info!("Plan {} v{} withdrawn: {}", plan.id, plan.version, reason);
        plan.error = Some(reason);
        plan.transition(PlanStatus::Cancelled)?;
        self.store.update_plan(plan).await?;
        self.emit(PlanEvent::PlanCancelled {
            plan_id: plan.id.clone(),
        });
        Ok(())
    }

    /// Decompose into a draft plan: one shot, or the best of several strategy variants
    async fn generate(
        &self,
        task: &Task,
        version: u32,
        context: &DecompositionContext,
    ) -> EngineResult<Plan> {
        if !self.config.generate_alternatives {
            return self
                .planner
                .create_plan(&task.description, version, context)
                .await
                .map_err(EngineError::from_anyhow);
        }

        let ranked = self
            .planner
            .create_alternatives(&task.description, version, context)
            .await
            .map_err(EngineError::from_anyhow)?;
        ranked
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Decomposition("no alternative produced".to_string()))
    }

    async fn store_plan(&self, plan: &Plan) -> EngineResult<()> {
        self.store.insert_plan(plan).await?;
        self.emit(PlanEvent::PlanCreated {
            task_id: plan.task_id.clone(),
            plan_id: plan.id.clone(),
            version: plan.version,
            total_steps: plan.steps.len(),
        });
        Ok(())
    }

    /// Human action on a task in `requires_human`
    pub async fn resolve_intervention(
        &self,
        task_id: &str,
        action: InterventionAction,
    ) -> EngineResult<Task> {
        let mut task = self.store.require_task(task_id).await?;
        if task.status != TaskStatus::RequiresHuman {
            return Err(EngineError::InvalidTransition {
                entity: "task",
                id: task.id.clone(),
                from: task.status.to_string(),
                to: "intervention resolved".to_string(),
            });
        }
        tracing::info!("Task {} intervention resolved: {:?}", task.id, action);

        match action {
            InterventionAction::Abandon => {
                task.set_status(TaskStatus::Cancelled);
                self.store.update_task(&task).await?;
                Ok(task)
            }
            InterventionAction::Retry => {
                task.replan_attempts = 0;
                task.consecutive_failures = 0;
                task.intervention_reason = None;
                task.force_approval = true;
                task.set_status(TaskStatus::Planning);
                self.store.update_task(&task).await?;

                let previous = self
                    .store
                    .latest_plan(&task.id)
                    .await?
                    .ok_or_else(|| EngineError::plan_not_found(format!("latest of {}", task.id)))?;
                let error = match task.failure_history.last() {
                    Some(last) => last.to_classified(),
                    None => self.classifier.classify(
                        "Retry requested after human intervention",
                        ErrorContext::for_plan(&previous.id),
                    ),
                };
                let plan = self.replan(&mut task, &previous, &error).await?;
                self.drive(task, plan).await
            }
        }
    }

    /// Task, latest plan, progress and the full version chain
    pub async fn task_status(&self, task_id: &str) -> EngineResult<TaskReport> {
        let task = self.store.require_task(task_id).await?;
        let versions = self.store.plan_versions(task_id).await?;
        let current_plan = versions.last().cloned();
        let progress_percent = current_plan
            .as_ref()
            .map(|p| p.progress_percent())
            .unwrap_or(0.0);
        Ok(TaskReport {
            task,
            current_plan,
            progress_percent,
            versions,
        })
    }

    /// Cancel the plan currently executing for a task. Returns false if none is.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.with_handle(task_id, CancelHandle::cancel)
    }

    pub fn pause_task(&self, task_id: &str) -> bool {
        self.with_handle(task_id, CancelHandle::pause)
    }

    pub fn resume_task(&self, task_id: &str) -> bool {
        self.with_handle(task_id, CancelHandle::resume)
    }

    fn with_handle(&self, task_id: &str, f: impl FnOnce(&CancelHandle)) -> bool {
        match self.running.lock() {
            Ok(running) => match running.get(task_id) {
                Some(handle) => {
                    f(handle);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn register(&self, task_id: &str) -> CancelHandle {
        let handle = CancelHandle::new();
        if let Ok(mut running) = self.running.lock() {
            running.insert(task_id.to_string(), handle.clone());
        }
        handle
    }

    fn unregister(&self, task_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(task_id);
        }
    }

    fn emit(&self, event: PlanEvent) {
        let _ = self.event_tx.send(event);
    }
}
