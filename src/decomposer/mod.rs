//! Decomposer capability
//!
//! Turns a task description into a goal, a strategy and ordered steps. How
//! that happens is opaque to the engine: an LLM, a file, a test script.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod file;
pub mod llm;

pub use file::FileDecomposer;
pub use llm::LlmDecomposer;

use crate::classifier::ClassifiedError;
use crate::planning::types::{FailureRecord, Step, Strategy, StrategyVariant};

/// Plan body produced by a decomposer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecomposedPlan {
    pub goal: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

/// A step that finished before the failure, carried into the next version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub id: String,
    pub description: String,
    pub result: Option<Value>,
}

/// Everything a decomposer needs to produce a revised plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanContext {
    /// 1 for the first replan of the task
    pub attempt: u32,
    pub error: ClassifiedError,
    pub completed_steps: Vec<CompletedStep>,
    pub failure_history: Vec<FailureRecord>,
    pub previous_plan_id: String,
    pub previous_version: u32,
    pub previous_goal: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecompositionContext {
    pub task_id: String,
    #[serde(default)]
    pub variant: StrategyVariant,
    /// Set when replanning after a failure
    #[serde(default)]
    pub replan: Option<ReplanContext>,
}

impl DecompositionContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: StrategyVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_replan(mut self, replan: ReplanContext) -> Self {
        self.replan = Some(replan);
        self
    }

    pub fn is_replan(&self) -> bool {
        self.replan.is_some()
    }
}

#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(
        &self,
        description: &str,
        context: &DecompositionContext,
    ) -> Result<DecomposedPlan>;
}

/// Pull a JSON object out of free text: bare, fenced in markdown, or behind a prefix
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();
    if text.starts_with('{') && text.ends_with('}') {
        return text;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}
