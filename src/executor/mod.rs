//! Plan executor
//!
//! Drives one plan from `approved` to a terminal status. Steps run in
//! dependency order, dispatched by kind, each actor invocation wrapped in the
//! configured timeout. Failures are classified and reported in the
//! [`ExecutionOutcome`]; whether to replan is the coordinator's call.

mod cancel;

pub use cancel::{CancelHandle, RunSignal};

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::actors::{
    is_affirmative, verdict_label, ActorInvoker, ActorResponse, InvocationPurpose,
    InvocationRequest,
};
use crate::approval::{ActorStats, ApprovalGate, ApprovalRequest, ApprovalService, ApprovalVerdict};
use crate::classifier::{ClassifiedError, ErrorClassifier, ErrorContext};
use crate::config::{ExecutorConfig, MediumFailurePolicy};
use crate::error::{EngineError, EngineResult};
use crate::persistence::{ActorExecution, PlanStore};
use crate::planning::graph::{self, Blocked};
use crate::planning::types::{
    ActorRef, Condition, Plan, PlanEvent, PlanStatus, Step, StepKind, StepStatus, Task,
};

/// Result of one [`PlanExecutor::execute_plan`] call
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Final persisted state of the plan
    pub plan: Plan,
    /// The failure that decided the outcome; `None` on success or cancellation
    pub error: Option<ClassifiedError>,
    /// Steps whose invocation timed out during this run
    pub timed_out_steps: Vec<String>,
}

impl ExecutionOutcome {
    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }

    pub fn is_success(&self) -> bool {
        self.plan.status == PlanStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.plan.status == PlanStatus::Cancelled
    }
}

enum StepOutcome {
    Completed { result: Value, skip: Vec<String> },
    Failed { message: String, timed_out: bool },
    /// Cancelled while in flight; the step goes back to pending
    Interrupted,
}

impl StepOutcome {
    fn completed(result: Value) -> Self {
        StepOutcome::Completed {
            result,
            skip: Vec::new(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        StepOutcome::Failed {
            message: message.into(),
            timed_out: false,
        }
    }
}

struct StepRun {
    index: usize,
    outcome: StepOutcome,
    duration_ms: u64,
}

enum HumanWait {
    Approved,
    Rejected(Option<String>),
    Interrupted,
    Failed(String),
}

#[derive(Default)]
struct RunState {
    /// Failure that stopped scheduling
    fatal: Option<ClassifiedError>,
    /// First failure the policy let the plan continue past
    first_failure: Option<ClassifiedError>,
    /// Failed validation steps that do not fail the plan
    tolerated: BTreeSet<String>,
    timed_out: Vec<String>,
}

/// Executes approved plans against actors and human reviewers
pub struct PlanExecutor {
    config: ExecutorConfig,
    classifier: ErrorClassifier,
    gate: ApprovalGate,
    store: Arc<dyn PlanStore>,
    actors: Arc<dyn ActorInvoker>,
    approvals: Arc<dyn ApprovalService>,
    event_tx: mpsc::UnboundedSender<PlanEvent>,
}

impl PlanExecutor {
    pub fn new(
        config: ExecutorConfig,
        classifier: ErrorClassifier,
        gate: ApprovalGate,
        store: Arc<dyn PlanStore>,
        actors: Arc<dyn ActorInvoker>,
        approvals: Arc<dyn ApprovalService>,
        event_tx: mpsc::UnboundedSender<PlanEvent>,
    ) -> Self {
        Self {
            config,
            classifier,
            gate,
            store,
            actors,
            approvals,
            event_tx,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run an approved plan to a terminal status.
    ///
    /// Claims the plan on the store first, so a plan is never executed twice
    /// and never alongside another plan of the same task. `task` supplies the
    /// autonomy level, the replan attempt and the per-step timeout history.
    ///
    /// Once claimed, the plan always leaves `executing`: an internal error
    /// (a store write, a state machine violation) fails the plan with that
    /// error classified, and the outcome is returned like any other failure.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        task: &Task,
        cancel: &CancelHandle,
    ) -> EngineResult<ExecutionOutcome> {
        let mut plan = self.store.claim_execution(&plan.id).await?;
        let started = Instant::now();
        self.emit(PlanEvent::PlanClaimed {
            task_id: plan.task_id.clone(),
            plan_id: plan.id.clone(),
        });

        let mut state = RunState::default();
        match self
            .run_claimed(&mut plan, task, cancel, started, &mut state)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.abort(plan, task, started, state, e).await,
        }
    }

    async fn run_claimed(
        &self,
        plan: &mut Plan,
        task: &Task,
        cancel: &CancelHandle,
        started: Instant,
        state: &mut RunState,
    ) -> EngineResult<ExecutionOutcome> {
        tracing::info!(
            "Executing plan {} v{} for task {} ({} steps)",
            plan.id,
            plan.version,
            plan.task_id,
            plan.steps.len()
        );
        self.emit(PlanEvent::PlanStarted {
            plan_id: plan.id.clone(),
        });

        if let Err(issue) = graph::validate(plan) {
            tracing::error!("Plan {} is structurally invalid: {}", plan.id, issue);
            let error = self
                .classifier
                .classify(&issue.to_string(), self.plan_context(plan, task));
            return self.finish(plan, started, Some(error), Vec::new()).await;
        }

        loop {
            match cancel.signal() {
                RunSignal::Cancel => {
                    return self.cancel(plan, started, state.timed_out.clone()).await
                }
                RunSignal::Pause => {
                    if !self.pause(plan, cancel).await? {
                        return self.cancel(plan, started, state.timed_out.clone()).await;
                    }
                }
                RunSignal::Run => {}
            }

            self.propagate_blocked(plan, state);
            let ready = graph::ready_steps(plan);
            if ready.is_empty() {
                break;
            }

            let batch: Vec<usize> = ready
                .into_iter()
                .take(self.config.max_parallel_steps.max(1))
                .collect();
            for &index in &batch {
                plan.start_step(index)?;
                let step = &plan.steps[index];
                tracing::info!("Step {} started: {}", step.id, step.description);
                self.emit(PlanEvent::StepStarted {
                    plan_id: plan.id.clone(),
                    step_id: step.id.clone(),
                    index,
                    description: step.description.clone(),
                });
            }
            self.store.update_plan(plan).await?;

            let snapshot: &Plan = plan;
            let runs = join_all(
                batch
                    .iter()
                    .map(|&index| self.run_step(snapshot, index, task, cancel)),
            )
            .await;

            let mut interrupted = false;
            for run in runs {
                interrupted |= self.apply(plan, task, run, state);
            }
            self.propagate_blocked(plan, state);
            self.store.update_plan(plan).await?;

            if interrupted || cancel.is_cancelled() {
                return self.cancel(plan, started, state.timed_out.clone()).await;
            }
            if state.fatal.is_some() {
                break;
            }
        }

        let error = self.final_error(plan, task, state);
        self.finish(plan, started, error, state.timed_out.clone())
            .await
    }

    /// Run a single step according to its kind. Never touches the plan.
    async fn run_step(
        &self,
        plan: &Plan,
        index: usize,
        task: &Task,
        cancel: &CancelHandle,
    ) -> StepRun {
        let step = &plan.steps[index];
        let started = Instant::now();

        let outcome = match &step.kind {
            StepKind::Action => self.run_action(plan, step, task, cancel).await,
            StepKind::Decision {
                condition,
                branches,
                default_branch,
            } => {
                self.run_decision(plan, step, condition, branches, default_branch.as_deref(), cancel)
                    .await
            }
            StepKind::Validation { condition } => {
                self.run_validation(plan, step, condition, cancel).await
            }
            StepKind::Approval { prompt } => {
                let summary = prompt.clone().unwrap_or_else(|| step.description.clone());
                match self.await_human(plan, step, summary, task, cancel).await {
                    HumanWait::Approved => StepOutcome::completed(json!({ "approved": true })),
                    HumanWait::Rejected(reason) => {
                        StepOutcome::failed(rejection_message(&step.id, reason))
                    }
                    HumanWait::Interrupted => StepOutcome::Interrupted,
                    HumanWait::Failed(message) => StepOutcome::failed(message),
                }
            }
        };

        StepRun {
            index,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_action(
        &self,
        plan: &Plan,
        step: &Step,
        task: &Task,
        cancel: &CancelHandle,
    ) -> StepOutcome {
        if step.approval_required {
            let stats = match &step.actor {
                Some(actor) => self.actor_stats(&actor.id).await,
                None => ActorStats::default(),
            };
            if self
                .gate
                .step_requires_approval(step, &stats, task.autonomy_level)
            {
                match self
                    .await_human(plan, step, step.description.clone(), task, cancel)
                    .await
                {
                    HumanWait::Approved => {}
                    HumanWait::Rejected(reason) => {
                        return StepOutcome::failed(rejection_message(&step.id, reason))
                    }
                    HumanWait::Interrupted => return StepOutcome::Interrupted,
                    HumanWait::Failed(message) => return StepOutcome::failed(message),
                }
            } else {
                tracing::info!(
                    "Step {} approval waived at autonomy level {}",
                    step.id,
                    task.autonomy_level
                );
            }
        }

        match self
            .invoke(plan, step, InvocationPurpose::Perform, cancel)
            .await
        {
            Ok(result) => StepOutcome::completed(result),
            Err(outcome) => outcome,
        }
    }

    async fn run_decision(
        &self,
        plan: &Plan,
        step: &Step,
        condition: &Condition,
        branches: &BTreeMap<String, Vec<String>>,
        default_branch: Option<&str>,
        cancel: &CancelHandle,
    ) -> StepOutcome {
        let verdict = match self.verdict(plan, step, condition, cancel).await {
            Ok(label) => label,
            Err(outcome) => return outcome,
        };

        let chosen = if branches.contains_key(&verdict) {
            verdict.clone()
        } else if let Some(default) = default_branch {
            default.to_string()
        } else {
            return StepOutcome::failed(format!(
                "Invalid input: decision step '{}' has no branch for verdict '{}'",
                step.id, verdict
            ));
        };

        // Steps listed only under branches that were not taken
        let kept: BTreeSet<&String> = branches
            .get(&chosen)
            .map(|ids| ids.iter().collect())
            .unwrap_or_default();
        let skip: BTreeSet<String> = branches
            .iter()
            .filter(|(label, _)| **label != chosen)
            .flat_map(|(_, ids)| ids)
            .filter(|id| !kept.contains(id))
            .cloned()
            .collect();

        tracing::info!("Decision {} took branch '{}'", step.id, chosen);
        StepOutcome::Completed {
            result: json!({ "verdict": verdict, "branch": chosen }),
            skip: skip.into_iter().collect(),
        }
    }

    async fn run_validation(
        &self,
        plan: &Plan,
        step: &Step,
        condition: &Condition,
        cancel: &CancelHandle,
    ) -> StepOutcome {
        match self.verdict(plan, step, condition, cancel).await {
            Ok(label) if is_affirmative(&label) => {
                StepOutcome::completed(json!({ "passed": true, "verdict": label }))
            }
            Ok(label) => StepOutcome::failed(format!(
                "Validation failed: {} (verdict '{}')",
                step.description, label
            )),
            Err(outcome) => outcome,
        }
    }

    /// Reduce a condition to a verdict label
    async fn verdict(
        &self,
        plan: &Plan,
        step: &Step,
        condition: &Condition,
        cancel: &CancelHandle,
    ) -> Result<String, StepOutcome> {
        match condition {
            Condition::Always { value } => Ok(value.to_string()),
            Condition::ResultEquals {
                step: source,
                pointer,
                value,
            } => {
                let actual = plan
                    .step(source)
                    .and_then(|s| s.result.as_ref())
                    .and_then(|result| result.pointer(pointer));
                Ok((actual == Some(value)).to_string())
            }
            Condition::ActorVerdict => {
                let result = self
                    .invoke(plan, step, InvocationPurpose::Verdict, cancel)
                    .await?;
                verdict_label(&result).ok_or_else(|| {
                    StepOutcome::failed(format!(
                        "Invalid input: no verdict in actor result for step '{}': {}",
                        step.id, result
                    ))
                })
            }
        }
    }

    /// Invoke the step's actor under the step timeout, racing cancellation
    async fn invoke(
        &self,
        plan: &Plan,
        step: &Step,
        purpose: InvocationPurpose,
        cancel: &CancelHandle,
    ) -> Result<Value, StepOutcome> {
        let actor = step.actor.as_ref().ok_or_else(|| {
            StepOutcome::failed(format!(
                "Actor not found: no actor assigned to step '{}'",
                step.id
            ))
        })?;

        let request = InvocationRequest {
            plan_id: plan.id.clone(),
            step_id: step.id.clone(),
            description: step.description.clone(),
            payload: step.invocation.clone().unwrap_or(Value::Null),
            purpose,
        };

        let timeout = self.config.step_timeout();
        let started = Instant::now();
        let response = tokio::select! {
            response = tokio::time::timeout(timeout, self.actors.invoke(actor, &request)) => response,
            _ = cancel.cancelled(self.config.cancel_poll_interval()) => {
                tracing::info!("Step {} interrupted by cancellation", step.id);
                return Err(StepOutcome::Interrupted);
            }
        };

        let (outcome, error) = match response {
            Ok(Ok(ActorResponse::Success { result })) => (Ok(result), None),
            Ok(Ok(ActorResponse::Failure { error })) => {
                (Err(StepOutcome::failed(error.clone())), Some(error))
            }
            Ok(Err(e)) => {
                let message = format!("Actor {} invocation failed: {:#}", actor, e);
                (Err(StepOutcome::failed(message.clone())), Some(message))
            }
            Err(_) => {
                let message = format!("Step execution timeout after {}s", timeout.as_secs());
                (
                    Err(StepOutcome::Failed {
                        message: message.clone(),
                        timed_out: true,
                    }),
                    Some(message),
                )
            }
        };

        self.record(actor, plan, step, started, error).await;
        outcome
    }

    async fn record(
        &self,
        actor: &ActorRef,
        plan: &Plan,
        step: &Step,
        started: Instant,
        error: Option<String>,
    ) {
        let execution = ActorExecution {
            actor_id: actor.id.clone(),
            plan_id: plan.id.clone(),
            step_id: step.id.clone(),
            success: error.is_none(),
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            executed_at: Utc::now(),
        };
        if let Err(e) = self.store.record_actor_execution(&execution).await {
            tracing::warn!("Failed to record execution of actor {}: {:#}", actor.id, e);
        }
    }

    async fn actor_stats(&self, actor_id: &str) -> ActorStats {
        match self
            .store
            .recent_actor_stats(actor_id, self.gate.config().recent_window_days)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("No history for actor {}: {:#}", actor_id, e);
                ActorStats::default()
            }
        }
    }

    /// Ask a human about one step and wait for the answer
    async fn await_human(
        &self,
        plan: &Plan,
        step: &Step,
        summary: String,
        task: &Task,
        cancel: &CancelHandle,
    ) -> HumanWait {
        let request = ApprovalRequest {
            task_id: task.id.clone(),
            plan_id: plan.id.clone(),
            plan_version: plan.version,
            step_id: Some(step.id.clone()),
            summary,
            decision: None,
        };
        let approval_id = match self.approvals.request_approval(request).await {
            Ok(id) => id,
            Err(e) => return HumanWait::Failed(format!("Approval request failed: {:#}", e)),
        };

        tracing::info!("Step {} waiting for approval {}", step.id, approval_id);
        self.emit(PlanEvent::ApprovalRequested {
            plan_id: plan.id.clone(),
            step_id: Some(step.id.clone()),
            approval_id: approval_id.clone(),
        });

        let wait = async {
            let decision = self.approvals.await_decision(&approval_id);
            match self.config.approval_wait_timeout() {
                Some(limit) => match tokio::time::timeout(limit, decision).await {
                    Ok(verdict) => verdict.map_err(|e| format!("Approval failed: {:#}", e)),
                    Err(_) => Err(format!(
                        "Approval wait timed out after {}s",
                        limit.as_secs()
                    )),
                },
                None => decision
                    .await
                    .map_err(|e| format!("Approval failed: {:#}", e)),
            }
        };

        let verdict = tokio::select! {
            verdict = wait => verdict,
            _ = cancel.cancelled(self.config.cancel_poll_interval()) => {
                return HumanWait::Interrupted;
            }
        };

        match verdict {
            Ok(verdict) => {
                self.emit(PlanEvent::ApprovalResolved {
                    plan_id: plan.id.clone(),
                    step_id: Some(step.id.clone()),
                    approved: verdict.is_approved(),
                });
                match verdict {
                    ApprovalVerdict::Approved => HumanWait::Approved,
                    ApprovalVerdict::Rejected { reason } => HumanWait::Rejected(reason),
                }
            }
            Err(message) => HumanWait::Failed(message),
        }
    }

    /// Record a step result on the plan. Returns true if the step was interrupted.
    fn apply(&self, plan: &mut Plan, task: &Task, run: StepRun, state: &mut RunState) -> bool {
        let StepRun {
            index,
            outcome,
            duration_ms,
        } = run;
        let plan_id = plan.id.clone();
        let step = &mut plan.steps[index];
        let step_id = step.id.clone();

        match outcome {
            StepOutcome::Completed { result, skip } => {
                step.status = StepStatus::Completed;
                step.result = Some(result);
                step.error = None;
                step.actual_duration_ms = Some(duration_ms);
                tracing::info!("Step {} completed in {}ms", step_id, duration_ms);
                self.emit(PlanEvent::StepCompleted {
                    plan_id,
                    step_id: step_id.clone(),
                    duration_ms,
                });
                for id in skip {
                    self.skip_step(plan, &id, format!("branch not taken at {}", step_id));
                }
                false
            }
            StepOutcome::Failed { message, timed_out } => {
                let context = ErrorContext::for_step(&plan_id, &step_id)
                    .with_attempt(task.replan_attempts + 1)
                    .with_timeout_count(task.timeout_count(&step_id));
                let error = self.classifier.classify(&message, context);

                step.status = StepStatus::Failed;
                step.error = Some(message.clone());
                step.actual_duration_ms = Some(duration_ms);
                let is_validation = matches!(step.kind, StepKind::Validation { .. });

                tracing::warn!("Step {} failed: {}", step_id, error);
                self.emit(PlanEvent::StepFailed {
                    plan_id,
                    step_id: step_id.clone(),
                    error: message,
                });

                if timed_out {
                    state.timed_out.push(step_id.clone());
                }

                if is_validation && !self.config.validation_failure_fails_plan {
                    state.tolerated.insert(step_id);
                } else if is_validation
                    || error.is_severe()
                    || self.config.medium_failure_policy == MediumFailurePolicy::FailPlan
                {
                    if state.fatal.is_none() {
                        state.fatal = Some(error);
                    }
                } else if state.first_failure.is_none() {
                    state.first_failure = Some(error);
                }
                false
            }
            StepOutcome::Interrupted => {
                step.reset();
                true
            }
        }
    }

    fn skip_step(&self, plan: &mut Plan, step_id: &str, reason: String) {
        let plan_id = plan.id.clone();
        let Some(step) = plan.step_mut(step_id) else {
            return;
        };
        if step.status != StepStatus::Pending {
            return;
        }
        step.status = StepStatus::Skipped;
        tracing::info!("Step {} skipped: {}", step_id, reason);
        self.emit(PlanEvent::StepSkipped {
            plan_id,
            step_id: step_id.to_string(),
            reason,
        });
    }

    /// Fail or skip pending steps whose dependencies can no longer complete
    fn propagate_blocked(&self, plan: &mut Plan, state: &RunState) {
        loop {
            let blocked = graph::blocked_steps(plan);
            if blocked.is_empty() {
                return;
            }
            for (index, reason) in blocked {
                let step_id = plan.steps[index].id.clone();
                match reason {
                    Blocked::Failed { dependency } if state.tolerated.contains(&dependency) => {
                        self.skip_step(plan, &step_id, format!("validation {} failed", dependency));
                    }
                    Blocked::Failed { dependency } => {
                        let message = format!("dependency {} failed", dependency);
                        let plan_id = plan.id.clone();
                        let step = &mut plan.steps[index];
                        step.status = StepStatus::Failed;
                        step.error = Some(message.clone());
                        tracing::warn!("Step {} not started: {}", step_id, message);
                        self.emit(PlanEvent::StepFailed {
                            plan_id,
                            step_id,
                            error: message,
                        });
                    }
                    Blocked::Skipped { dependency } => {
                        self.skip_step(plan, &step_id, format!("dependency {} skipped", dependency));
                    }
                }
            }
        }
    }

    /// `None` when the plan counts as completed
    fn final_error(
        &self,
        plan: &Plan,
        task: &Task,
        state: &mut RunState,
    ) -> Option<ClassifiedError> {
        if let Some(error) = state.fatal.take() {
            return Some(error);
        }

        let unfinished: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| match s.status {
                StepStatus::Completed | StepStatus::Skipped => false,
                StepStatus::Failed => !state.tolerated.contains(&s.id),
                StepStatus::Pending | StepStatus::InProgress => true,
            })
            .map(|s| s.id.as_str())
            .collect();
        if unfinished.is_empty() {
            return None;
        }

        Some(state.first_failure.take().unwrap_or_else(|| {
            self.classifier.classify(
                &format!(
                    "Unknown dependency state: steps never became ready: {}",
                    unfinished.join(", ")
                ),
                self.plan_context(plan, task),
            )
        }))
    }

    fn plan_context(&self, plan: &Plan, task: &Task) -> ErrorContext {
        ErrorContext::for_plan(&plan.id).with_attempt(task.replan_attempts + 1)
    }

    async fn pause(&self, plan: &mut Plan, cancel: &CancelHandle) -> EngineResult<bool> {
        plan.transition(PlanStatus::Paused)?;
        self.store.update_plan(plan).await?;
        tracing::info!("Plan {} paused", plan.id);
        self.emit(PlanEvent::PlanPaused {
            plan_id: plan.id.clone(),
        });

        if !cancel
            .wait_resumed(self.config.cancel_poll_interval())
            .await
        {
            return Ok(false);
        }

        plan.transition(PlanStatus::Executing)?;
        self.store.update_plan(plan).await?;
        tracing::info!("Plan {} resumed", plan.id);
        self.emit(PlanEvent::PlanResumed {
            plan_id: plan.id.clone(),
        });
        Ok(true)
    }

    async fn cancel(
        &self,
        plan: &mut Plan,
        started: Instant,
        timed_out_steps: Vec<String>,
    ) -> EngineResult<ExecutionOutcome> {
        for step in plan
            .steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::InProgress)
        {
            step.reset();
        }
        plan.actual_duration_ms = Some(started.elapsed().as_millis() as u64);
        plan.transition(PlanStatus::Cancelled)?;
        self.store.update_plan(plan).await?;

        tracing::info!(
            "Plan {} cancelled after {}/{} steps",
            plan.id,
            plan.completed_count(),
            plan.steps.len()
        );
        self.emit(PlanEvent::PlanCancelled {
            plan_id: plan.id.clone(),
        });

        Ok(ExecutionOutcome {
            plan: plan.clone(),
            error: None,
            timed_out_steps,
        })
    }

    async fn finish(
        &self,
        plan: &mut Plan,
        started: Instant,
        error: Option<ClassifiedError>,
        timed_out_steps: Vec<String>,
    ) -> EngineResult<ExecutionOutcome> {
        plan.actual_duration_ms = Some(started.elapsed().as_millis() as u64);
        plan.error = error.as_ref().map(|e| e.to_string());
        plan.transition(if error.is_some() {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        })?;
        self.store.update_plan(plan).await?;

        match &error {
            Some(e) => tracing::error!("Plan {} failed: {}", plan.id, e),
            None => tracing::info!("Plan {} completed: {}", plan.id, plan.summary()),
        }
        self.emit(PlanEvent::PlanCompleted {
            plan_id: plan.id.clone(),
            success: error.is_none(),
            summary: plan.summary(),
        });

        Ok(ExecutionOutcome {
            plan: plan.clone(),
            error,
            timed_out_steps,
        })
    }

    /// Fail a claimed plan after an internal error so the claim is released.
    ///
    /// Steps in flight go back to pending. If the failed plan cannot be
    /// written either, the original error is returned.
    async fn abort(
        &self,
        mut plan: Plan,
        task: &Task,
        started: Instant,
        state: RunState,
        cause: EngineError,
    ) -> EngineResult<ExecutionOutcome> {
        tracing::error!("Plan {} aborted: {}", plan.id, cause);
        let error = self
            .classifier
            .classify(&cause.to_string(), self.plan_context(&plan, task));

        for step in plan
            .steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::InProgress)
        {
            step.reset();
        }
        if !plan.status.is_terminal() {
            plan.actual_duration_ms = Some(started.elapsed().as_millis() as u64);
            plan.error = Some(error.to_string());
            plan.transition(PlanStatus::Failed)?;
        }
        if let Err(e) = self.store.update_plan(&plan).await {
            tracing::error!("Plan {} could not be released: {:#}", plan.id, e);
            return Err(cause);
        }

        self.emit(PlanEvent::PlanCompleted {
            plan_id: plan.id.clone(),
            success: false,
            summary: plan.summary(),
        });
        Ok(ExecutionOutcome {
            error: (plan.status == PlanStatus::Failed).then_some(error),
            plan,
            timed_out_steps: state.timed_out,
        })
    }

    fn emit(&self, event: PlanEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn rejection_message(step_id: &str, reason: Option<String>) -> String {
    match reason {
        Some(reason) => format!("Approval rejected for step '{}': {}", step_id, reason),
        None => format!("Approval rejected for step '{}'", step_id),
    }
}
