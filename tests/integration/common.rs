use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planwright::actors::{ActorInvoker, ActorResponse, InvocationRequest};
use planwright::approval::{ActorStats, ApprovalService};
use planwright::config::Config;
use planwright::decomposer::{DecomposedPlan, Decomposer, DecompositionContext};
use planwright::persistence::{ActorExecution, MemoryStore, PlanStore};
use planwright::planning::{ActorRef, Plan, PlanEvent, PlanStatus, Step, Task};
use planwright::{Coordinator, EngineResult};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Configuration with no waiting between replans
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.replanning.min_interval_secs = 0;
    config.replanning.attempt_timeout_secs = 5;
    config.executor.step_timeout_secs = 5;
    config.executor.cancel_poll_interval_ms = 10;
    config
}

/// Action step run by the scripted actor
pub fn action(id: &str, deps: &[&str]) -> Step {
    Step::new(id, format!("do {}", id))
        .with_dependencies(deps.iter().copied())
        .with_actor(ActorRef::tool("scripted"))
}

pub fn body(goal: &str, steps: Vec<Step>) -> DecomposedPlan {
    DecomposedPlan {
        goal: goal.to_string(),
        steps,
        ..Default::default()
    }
}

/// Hands out plan bodies in call order, repeating the last one.
/// Every context it is called with is kept, with the time of the call.
pub struct ScriptedDecomposer {
    bodies: Vec<Option<DecomposedPlan>>,
    /// `None` entries never answer instead of failing
    hang: bool,
    calls: Mutex<Vec<(Instant, DecompositionContext)>>,
}

impl ScriptedDecomposer {
    pub fn new(bodies: Vec<DecomposedPlan>) -> Self {
        Self::with_failures(bodies.into_iter().map(Some).collect())
    }

    /// `None` entries make that call fail
    pub fn with_failures(bodies: Vec<Option<DecomposedPlan>>) -> Self {
        Self {
            bodies,
            hang: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `None` entries make that call hang
    pub fn hanging(bodies: Vec<Option<DecomposedPlan>>) -> Self {
        Self {
            hang: true,
            ..Self::with_failures(bodies)
        }
    }

    pub fn calls(&self) -> Vec<DecompositionContext> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, context)| context.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl Decomposer for ScriptedDecomposer {
    async fn decompose(
        &self,
        _description: &str,
        context: &DecompositionContext,
    ) -> Result<DecomposedPlan> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), context.clone()));
            calls.len() - 1
        };
        let index = call.min(self.bodies.len().saturating_sub(1));
        match self.bodies.get(index).cloned().flatten() {
            Some(body) => Ok(body),
            None if self.hang => std::future::pending().await,
            None => anyhow::bail!("model returned nothing usable"),
        }
    }
}

/// Succeeds with `{"step": id}` unless the step id is scripted to fail
#[derive(Default)]
pub struct ScriptedActor {
    failures: Mutex<HashMap<String, String>>,
    delays: HashMap<String, Duration>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedActor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, step_id: &str, message: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(step_id.to_string(), message.to_string());
        self
    }

    /// Answer for this step only after `delay`
    pub fn slow(mut self, step_id: &str, delay: Duration) -> Self {
        self.delays.insert(step_id.to_string(), delay);
        self
    }

    pub fn heal(&self, step_id: &str) {
        self.failures.lock().unwrap().remove(step_id);
    }

    pub fn invocations(&self, step_id: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == step_id)
            .count()
    }
}

#[async_trait]
impl ActorInvoker for ScriptedActor {
    async fn invoke(&self, _actor: &ActorRef, request: &InvocationRequest) -> Result<ActorResponse> {
        self.invocations
            .lock()
            .unwrap()
            .push(request.step_id.clone());
        if let Some(delay) = self.delays.get(&request.step_id) {
            tokio::time::sleep(*delay).await;
        }
        let failure = self.failures.lock().unwrap().get(&request.step_id).cloned();
        Ok(match failure {
            Some(message) => ActorResponse::failure(message),
            None => ActorResponse::success(json!({ "step": request.step_id })),
        })
    }
}

/// Memory store whose chosen writes fail once
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_executing_update: AtomicBool,
    fail_claim: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next write of an executing plan fails with "disk full"
    pub fn failing_executing_update(self) -> Self {
        self.fail_executing_update.store(true, Ordering::SeqCst);
        self
    }

    /// The next claim fails with "database is locked"
    pub fn failing_claim(self) -> Self {
        self.fail_claim.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl PlanStore for FlakyStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.inner.insert_task(task).await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.inner.update_task(task).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.inner.list_tasks().await
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        self.inner.insert_plan(plan).await
    }

    async fn update_plan(&self, plan: &Plan) -> Result<()> {
        if plan.status == PlanStatus::Executing
            && self.fail_executing_update.swap(false, Ordering::SeqCst)
        {
            anyhow::bail!("disk full");
        }
        self.inner.update_plan(plan).await
    }

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        self.inner.get_plan(id).await
    }

    async fn plan_versions(&self, task_id: &str) -> Result<Vec<Plan>> {
        self.inner.plan_versions(task_id).await
    }

    async fn claim_execution(&self, plan_id: &str) -> EngineResult<Plan> {
        if self.fail_claim.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("database is locked").into());
        }
        self.inner.claim_execution(plan_id).await
    }

    async fn record_actor_execution(&self, execution: &ActorExecution) -> Result<()> {
        self.inner.record_actor_execution(execution).await
    }

    async fn actor_stats(&self, actor_id: &str, since: DateTime<Utc>) -> Result<ActorStats> {
        self.inner.actor_stats(actor_id, since).await
    }
}

/// A coordinator over shared fixtures
pub struct Harness {
    pub coordinator: Coordinator,
    pub store: Arc<dyn PlanStore>,
    pub decomposer: Arc<ScriptedDecomposer>,
    pub actor: Arc<ScriptedActor>,
    pub events: mpsc::UnboundedReceiver<PlanEvent>,
}

impl Harness {
    pub fn new(
        config: Config,
        decomposer: ScriptedDecomposer,
        actor: ScriptedActor,
        approvals: Arc<dyn ApprovalService>,
    ) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), decomposer, actor, approvals)
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn PlanStore>,
        decomposer: ScriptedDecomposer,
        actor: ScriptedActor,
        approvals: Arc<dyn ApprovalService>,
    ) -> Self {
        let decomposer = Arc::new(decomposer);
        let actor = Arc::new(actor);
        let (tx, events) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            &config,
            store.clone(),
            decomposer.clone(),
            actor.clone(),
            approvals,
            tx,
        );
        Self {
            coordinator,
            store,
            decomposer,
            actor,
            events,
        }
    }

    /// Everything emitted so far
    pub fn drain_events(&mut self) -> Vec<PlanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
