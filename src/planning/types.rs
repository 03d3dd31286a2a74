//! Core types for tasks, plans and steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::classifier::{ClassifiedError, ErrorCategory, ErrorContext, Severity};
use crate::error::{EngineError, EngineResult};

/// Who created or may approve a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    #[default]
    Human,
    System,
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Planning,
    AwaitingApproval,
    Executing,
    Replanning,
    /// Automatic recovery stopped; nothing runs until a human acts
    RequiresHuman,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Executing => "executing",
            TaskStatus::Replanning => "replanning",
            TaskStatus::RequiresHuman => "requires_human",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure remembered on the task across plan versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub plan_id: String,
    pub plan_version: u32,
    pub step_id: Option<String>,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    /// Rebuild the classified error this record was made from
    pub fn to_classified(&self) -> ClassifiedError {
        ClassifiedError {
            severity: self.severity,
            category: self.category,
            requires_replanning: self.severity >= Severity::High,
            message: self.message.clone(),
            context: ErrorContext {
                plan_id: Some(self.plan_id.clone()),
                step_id: self.step_id.clone(),
                attempt: 1,
                ..Default::default()
            },
        }
    }
}

/// The persistent unit of user intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub creator_role: Role,
    pub approver_role: Role,
    /// 0 = every plan is reviewed by a human, 4 = maximum autonomy
    pub autonomy_level: u8,
    /// Replans performed for this task, across all versions
    pub replan_attempts: u32,
    /// Failed plan versions or replan attempts since the last success
    pub consecutive_failures: u32,
    pub last_replan_at: Option<DateTime<Utc>>,
    /// Timeout occurrences per step id
    #[serde(default)]
    pub step_timeouts: BTreeMap<String, u32>,
    #[serde(default)]
    pub failure_history: Vec<FailureRecord>,
    pub intervention_reason: Option<String>,
    /// Set after a human-resolved escalation: the next plan must be approved by a human
    #[serde(default)]
    pub force_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MAX_AUTONOMY_LEVEL: u8 = 4;

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            creator_role: Role::Human,
            approver_role: Role::Human,
            autonomy_level: 2,
            replan_attempts: 0,
            consecutive_failures: 0,
            last_replan_at: None,
            step_timeouts: BTreeMap::new(),
            failure_history: Vec::new(),
            intervention_reason: None,
            force_approval: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_autonomy(mut self, level: u8) -> Self {
        self.autonomy_level = level.min(MAX_AUTONOMY_LEVEL);
        self
    }

    pub fn with_creator(mut self, role: Role) -> Self {
        self.creator_role = role;
        self
    }

    pub fn with_approver(mut self, role: Role) -> Self {
        self.approver_role = role;
        self
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Number of earlier timeouts recorded for a step
    pub fn timeout_count(&self, step_id: &str) -> u32 {
        self.step_timeouts.get(step_id).copied().unwrap_or(0)
    }

    pub fn record_timeout(&mut self, step_id: &str) {
        *self.step_timeouts.entry(step_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_failure(&mut self, plan: &Plan, error: &ClassifiedError) {
        self.failure_history.push(FailureRecord {
            plan_id: plan.id.clone(),
            plan_version: plan.version,
            step_id: error.context.step_id.clone(),
            severity: error.severity,
            category: error.category,
            message: error.message.clone(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }
}

/// Reference to the agent or tool that carries out a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: String,
    #[serde(default)]
    pub kind: ActorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    #[default]
    Agent,
    Tool,
}

impl ActorRef {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Agent,
        }
    }

    pub fn tool(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Tool,
        }
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// How a decision or validation step reaches its verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Ask the assigned actor; its result decides
    ActorVerdict,
    /// Compare a value inside a completed step's result (JSON pointer)
    ResultEquals {
        step: String,
        pointer: String,
        value: Value,
    },
    Always {
        value: bool,
    },
}

/// What a step does; one handler per variant in the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke the assigned actor
    Action,
    /// Pick a branch; steps listed only under other branches are skipped
    Decision {
        condition: Condition,
        /// Branch label -> step ids that belong to that branch
        branches: BTreeMap<String, Vec<String>>,
        #[serde(default)]
        default_branch: Option<String>,
    },
    /// Check a condition; an unmet condition fails the step
    Validation { condition: Condition },
    /// Block until a human approves
    Approval {
        #[serde(default)]
        prompt: Option<String>,
    },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Action => "action",
            StepKind::Decision { .. } => "decision",
            StepKind::Validation { .. } => "validation",
            StepKind::Approval { .. } => "approval",
        }
    }

    pub fn is_gate(&self) -> bool {
        matches!(self, StepKind::Validation { .. } | StepKind::Approval { .. })
    }
}

impl Default for StepKind {
    fn default() -> Self {
        StepKind::Action
    }
}

/// Status of a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            StepStatus::Pending => "◯",
            StepStatus::InProgress => "◐",
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Skipped => "−",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// One unit of work inside a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the plan
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub kind: StepKind,
    /// Step ids that must be completed first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub actor: Option<ActorRef>,
    /// Structured payload handed to the actor
    #[serde(default)]
    pub invocation: Option<Value>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub actual_duration_ms: Option<u64>,
    #[serde(default)]
    pub approval_required: bool,
}

impl Step {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: StepKind::Action,
            dependencies: Vec::new(),
            actor: None,
            invocation: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            estimated_duration_secs: None,
            actual_duration_ms: None,
            approval_required: false,
        }
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_actor(mut self, actor: ActorRef) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_invocation(mut self, payload: Value) -> Self {
        self.invocation = Some(payload);
        self
    }

    pub fn with_estimate(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    /// Counts toward the plan's approval points
    pub fn needs_human(&self) -> bool {
        self.approval_required || matches!(self.kind, StepKind::Approval { .. })
    }

    /// Clear execution state so the step can run again in a new version
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error = None;
        self.actual_duration_ms = None;
    }
}

/// Overall plan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }

    /// Allowed moves of the plan state machine
    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Draft, PendingApproval)
                | (Draft, Approved)
                | (PendingApproval, Approved)
                | (Approved, PendingApproval)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Paused)
                | (Paused, Executing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::PendingApproval => "pending_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Paused => "paused",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured rationale behind a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

/// Flavour requested from the decomposer when generating alternatives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyVariant {
    /// More steps, more validation
    Conservative,
    #[default]
    Balanced,
    /// Fewer steps, optimistic assumptions
    Aggressive,
}

impl StrategyVariant {
    pub fn all() -> &'static [StrategyVariant] {
        &[
            StrategyVariant::Conservative,
            StrategyVariant::Balanced,
            StrategyVariant::Aggressive,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyVariant::Conservative => "conservative",
            StrategyVariant::Balanced => "balanced",
            StrategyVariant::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for StrategyVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set on plans produced by multi-strategy generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeMeta {
    pub strategy: StrategyVariant,
    pub score: f64,
    /// 1 = best
    pub rank: usize,
    pub is_best: bool,
}

/// Keys used in [`Plan::context`]
pub mod context_keys {
    pub const ERROR_ANALYSIS: &str = "error_analysis";
    pub const COMPLETED_STEPS: &str = "completed_steps";
    pub const FAILURE_HISTORY: &str = "failure_history";
    pub const PREVIOUS_PLAN: &str = "previous_plan";
    pub const APPROVAL: &str = "approval";
    pub const EVALUATION: &str = "evaluation";
}

/// One versioned strategy for achieving a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub task_id: String,
    /// Starts at 1, incremented on every replan
    pub version: u32,
    /// The plan whose failure produced this version
    pub parent_plan_id: Option<String>,
    pub goal: String,
    pub strategy: Strategy,
    pub steps: Vec<Step>,
    pub status: PlanStatus,
    /// Index of the step most recently started
    pub current_step: Option<usize>,
    pub estimated_duration_secs: Option<u64>,
    pub actual_duration_ms: Option<u64>,
    /// Free-form data carried across replans (error analysis, completed steps)
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub alternative: Option<AlternativeMeta>,
    /// Human-readable reason when the plan failed
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(task_id: impl Into<String>, version: u32, goal: impl Into<String>) -> Self {
        Self {
            id: format!("plan-{}", uuid::Uuid::new_v4()),
            task_id: task_id.into(),
            version,
            parent_plan_id: None,
            goal: goal.into(),
            strategy: Strategy::default(),
            steps: Vec::new(),
            status: PlanStatus::Draft,
            current_step: None,
            estimated_duration_secs: None,
            actual_duration_ms: None,
            context: BTreeMap::new(),
            alternative: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_parent(mut self, parent_plan_id: impl Into<String>) -> Self {
        self.parent_plan_id = Some(parent_plan_id.into());
        self
    }

    /// Move the plan state machine, rejecting illegal moves
    pub fn transition(&mut self, next: PlanStatus) -> EngineResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "plan",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            PlanStatus::Executing if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// All dependencies exist and are completed. A missing dependency is never met.
    pub fn dependencies_met(&self, step: &Step) -> bool {
        step.dependencies.iter().all(|dep_id| {
            self.step(dep_id)
                .map(|s| s.status == StepStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Move a step to `in_progress`. Fails if any dependency is not completed.
    pub fn start_step(&mut self, index: usize) -> EngineResult<()> {
        let step = self
            .steps
            .get(index)
            .ok_or_else(|| EngineError::StructuralViolation(format!("no step at index {}", index)))?;

        if let Some(dep) = step.dependencies.iter().find(|dep_id| {
            self.step(dep_id)
                .map(|s| s.status != StepStatus::Completed)
                .unwrap_or(true)
        }) {
            return Err(EngineError::DependencyViolation {
                step_id: step.id.clone(),
                dependency: dep.clone(),
            });
        }

        if step.status != StepStatus::Pending {
            return Err(EngineError::InvalidTransition {
                entity: "step",
                id: step.id.clone(),
                from: step.status.as_str().to_string(),
                to: StepStatus::InProgress.as_str().to_string(),
            });
        }

        self.steps[index].status = StepStatus::InProgress;
        self.current_step = Some(index);
        Ok(())
    }

    pub fn completed_count(&self) -> usize {
        self.count(StepStatus::Completed)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Completed and skipped steps over all steps
    pub fn progress_percent(&self) -> f32 {
        if self.steps.is_empty() {
            0.0
        } else {
            let done = self.completed_count() + self.count(StepStatus::Skipped);
            (done as f32 / self.steps.len() as f32) * 100.0
        }
    }

    /// Steps that need a human sign-off
    pub fn approval_points(&self) -> usize {
        self.steps.iter().filter(|s| s.needs_human()).count()
    }

    /// Plan estimate, falling back to the sum of step estimates
    pub fn estimated_secs(&self, default_step_secs: u64) -> u64 {
        self.estimated_duration_secs.unwrap_or_else(|| {
            self.steps
                .iter()
                .map(|s| s.estimated_duration_secs.unwrap_or(default_step_secs))
                .sum()
        })
    }

    /// Every actor assigned to any step, without duplicates
    pub fn actors(&self) -> Vec<&ActorRef> {
        let mut actors: Vec<&ActorRef> = Vec::new();
        for actor in self.steps.iter().filter_map(|s| s.actor.as_ref()) {
            if !actors.contains(&actor) {
                actors.push(actor);
            }
        }
        actors
    }

    pub fn summary(&self) -> String {
        let completed = self.completed_count();
        let total = self.steps.len();
        let failed = self.count(StepStatus::Failed);

        if failed > 0 {
            format!(
                "{} (v{}): {}/{} steps completed, {} failed",
                self.goal, self.version, completed, total, failed
            )
        } else {
            format!(
                "{} (v{}): {}/{} steps completed",
                self.goal, self.version, completed, total
            )
        }
    }
}

/// Events emitted while a task moves through planning, approval and execution
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanCreated {
        task_id: String,
        plan_id: String,
        version: u32,
        total_steps: usize,
    },
    ApprovalRequested {
        plan_id: String,
        step_id: Option<String>,
        approval_id: String,
    },
    ApprovalResolved {
        plan_id: String,
        step_id: Option<String>,
        approved: bool,
    },
    PlanClaimed {
        task_id: String,
        plan_id: String,
    },
    PlanStarted {
        plan_id: String,
    },
    PlanPaused {
        plan_id: String,
    },
    PlanResumed {
        plan_id: String,
    },
    StepStarted {
        plan_id: String,
        step_id: String,
        index: usize,
        description: String,
    },
    StepCompleted {
        plan_id: String,
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        plan_id: String,
        step_id: String,
        error: String,
    },
    StepSkipped {
        plan_id: String,
        step_id: String,
        reason: String,
    },
    PlanCompleted {
        plan_id: String,
        success: bool,
        summary: String,
    },
    PlanCancelled {
        plan_id: String,
    },
    ReplanTriggered {
        task_id: String,
        failed_plan_id: String,
        attempt: u32,
    },
    HumanInterventionRequired {
        task_id: String,
        reason: String,
    },
}
