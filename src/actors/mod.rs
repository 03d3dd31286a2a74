//! Actor invocation capability
//!
//! An actor is the agent or tool that carries out a step. The executor only
//! sees [`ActorInvoker`]; the registry maps actor ids to implementations.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod shell;

pub use shell::ShellActor;

use crate::config::ActorsConfig;
use crate::planning::types::ActorRef;

/// Why the executor is calling the actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPurpose {
    /// Carry out an action step
    #[default]
    Perform,
    /// Answer a decision or validation condition
    Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub plan_id: String,
    pub step_id: String,
    pub description: String,
    /// Structured payload from the step, `Null` when absent
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub purpose: InvocationPurpose,
}

/// `{status, result|error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActorResponse {
    Success { result: Value },
    Failure { error: String },
}

impl ActorResponse {
    pub fn success(result: Value) -> Self {
        ActorResponse::Success { result }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ActorResponse::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActorResponse::Success { .. })
    }
}

/// Reduce an actor result to a verdict label: booleans and strings as-is,
/// objects through their `verdict` (or `passed`) field
pub fn verdict_label(result: &Value) -> Option<String> {
    match result {
        Value::Bool(b) => Some(b.to_string()),
        Value::String(s) => Some(s.trim().to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map
            .get("verdict")
            .or_else(|| map.get("passed"))
            .and_then(verdict_label),
        _ => None,
    }
}

/// Whether a verdict label means "condition satisfied"
pub fn is_affirmative(label: &str) -> bool {
    matches!(label, "true" | "yes" | "pass" | "passed" | "ok" | "1")
}

/// The capability the executor depends on
#[async_trait]
pub trait ActorInvoker: Send + Sync {
    /// `Err` is a transport failure; the executor treats it like a failed response
    async fn invoke(&self, actor: &ActorRef, request: &InvocationRequest) -> Result<ActorResponse>;
}

/// A single agent or tool
#[async_trait]
pub trait Actor: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    async fn invoke(&self, request: &InvocationRequest) -> Result<ActorResponse>;
}

/// Answers with its input. Useful for dry runs and plan files without real actors.
pub struct EchoActor;

#[async_trait]
impl Actor for EchoActor {
    fn id(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns the step payload (or description) as its result"
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<ActorResponse> {
        let result = match &request.payload {
            Value::Null => Value::String(request.description.clone()),
            payload => payload.clone(),
        };
        Ok(ActorResponse::success(result))
    }
}

#[derive(Default)]
pub struct ActorRegistry {
    actors: HashMap<String, Arc<dyn Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in actors enabled by configuration
    pub fn with_builtins(config: &ActorsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoActor));
        if config.shell_enabled {
            registry.register(Arc::new(ShellActor::new(config)));
        }
        registry
    }

    pub fn register(&mut self, actor: Arc<dyn Actor>) {
        self.actors.insert(actor.id().to_string(), actor);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Actor>> {
        self.actors.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.actors.keys().map(|k| k.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// One line per actor, for decomposition prompts
    pub fn describe(&self) -> String {
        self.ids()
            .into_iter()
            .filter_map(|id| self.actors.get(id))
            .map(|a| format!("- {}: {}", a.id(), a.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ActorInvoker for ActorRegistry {
    async fn invoke(&self, actor: &ActorRef, request: &InvocationRequest) -> Result<ActorResponse> {
        match self.actors.get(&actor.id) {
            Some(a) => a.invoke(request).await,
            None => Ok(ActorResponse::failure(format!("Actor not found: {}", actor.id))),
        }
    }
}
