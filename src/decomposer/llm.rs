//! LLM-backed decomposition

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;

use super::{extract_json, DecomposedPlan, Decomposer, DecompositionContext, ReplanContext};
use crate::llm::TextGenerator;
use crate::planning::types::{ActorRef, Step, StepKind, Strategy, StrategyVariant};

const SYSTEM_PROMPT: &str = r#"You are a planning expert. Break a task into a small graph of concrete, executable steps.

## Guidelines:
1. Each step does one thing and names the actor (agent or tool id) that performs it
2. List the ids of the steps each step depends on; steps without a relationship may run in parallel
3. Use "validation" steps to check results before anything destructive
4. Use "approval" steps where a human must sign off
5. Estimate each step's duration in seconds

## Output Format:
Respond with ONLY a JSON object (no markdown, no explanation):
{
  "goal": "One sentence goal",
  "strategy": {
    "approach": "How the plan gets there",
    "assumptions": ["..."],
    "constraints": ["..."],
    "success_criteria": ["..."]
  },
  "steps": [
    {
      "id": "step-1",
      "description": "Imperative description",
      "kind": {"type": "action"},
      "dependencies": [],
      "actor": "shell",
      "invocation": {"command": "echo hi"},
      "estimated_duration_secs": 30,
      "approval_required": false
    }
  ]
}

"kind" may also be {"type": "validation", "condition": {"kind": "actor_verdict"}} or {"type": "approval", "prompt": "..."}.

Important: Output ONLY the JSON object, nothing else."#;

#[derive(Debug, Deserialize)]
struct PlanResponse {
    goal: String,
    #[serde(default)]
    strategy: Strategy,
    #[serde(default)]
    steps: Vec<StepResponse>,
}

#[derive(Debug, Deserialize)]
struct StepResponse {
    #[serde(default)]
    id: Option<String>,
    description: String,
    #[serde(default)]
    kind: StepKind,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    invocation: Option<Value>,
    #[serde(default)]
    estimated_duration_secs: Option<u64>,
    #[serde(default)]
    approval_required: bool,
}

/// Decomposer that asks a text generator for a JSON plan
pub struct LlmDecomposer {
    generator: Arc<dyn TextGenerator>,
    /// Context appended to every prompt (available actors, environment)
    environment: Option<String>,
}

impl LlmDecomposer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            environment: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    fn build_prompt(&self, description: &str, context: &DecompositionContext) -> String {
        let mut prompt = format!("Create a plan for this task:\n\n{}\n", description);

        let flavour = match context.variant {
            StrategyVariant::Conservative => {
                "Be conservative: prefer more, smaller steps and add validation after every risky action."
            }
            StrategyVariant::Balanced => "Balance speed against safety.",
            StrategyVariant::Aggressive => {
                "Be aggressive: use the fewest steps possible and assume the happy path."
            }
        };
        let _ = write!(prompt, "\n{}\n", flavour);

        if let Some(env) = &self.environment {
            let _ = write!(prompt, "\nEnvironment:\n{}\n", env);
        }

        if let Some(replan) = &context.replan {
            prompt.push_str(&replan_section(replan));
        }

        prompt
    }

    pub(crate) fn parse_plan(text: &str) -> Result<DecomposedPlan> {
        let response: PlanResponse = serde_json::from_str(extract_json(text)).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse plan JSON: {}. Response was: {}",
                e,
                text.chars().take(200).collect::<String>()
            )
        })?;

        let steps = response
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let mut step = Step::new(s.id.unwrap_or_else(|| format!("step-{}", i + 1)), s.description)
                    .with_kind(s.kind)
                    .with_dependencies(s.dependencies);
                if let Some(actor) = s.actor {
                    step = step.with_actor(ActorRef::agent(actor));
                }
                if let Some(payload) = s.invocation {
                    step = step.with_invocation(payload);
                }
                step.estimated_duration_secs = s.estimated_duration_secs;
                step.approval_required = s.approval_required;
                step
            })
            .collect();

        Ok(DecomposedPlan {
            goal: response.goal,
            strategy: response.strategy,
            steps,
            estimated_duration_secs: None,
        })
    }
}

fn replan_section(replan: &ReplanContext) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "\n## The previous plan (version {}) failed\nGoal was: {}\nError: {}\n",
        replan.previous_version, replan.previous_goal, replan.error
    );
    if let Some(step) = &replan.error.context.step_id {
        let _ = writeln!(out, "Failed step: {}", step);
    }

    if !replan.completed_steps.is_empty() {
        out.push_str("\nAlready completed (do not redo; later steps may depend on these ids):\n");
        for step in &replan.completed_steps {
            let _ = writeln!(out, "- {}: {}", step.id, step.description);
        }
    }

    if replan.failure_history.len() > 1 {
        out.push_str("\nEarlier failures for this task:\n");
        for f in &replan.failure_history {
            let _ = writeln!(out, "- v{} [{}/{}] {}", f.plan_version, f.severity, f.category, f.message);
        }
    }

    out.push_str("\nProduce a revised plan that avoids the failure.\n");
    out
}

#[async_trait]
impl Decomposer for LlmDecomposer {
    async fn decompose(
        &self,
        description: &str,
        context: &DecompositionContext,
    ) -> Result<DecomposedPlan> {
        let prompt = self.build_prompt(description, context);
        tracing::debug!(
            "Requesting {} decomposition for task {}",
            context.variant,
            context.task_id
        );
        let completion = self.generator.generate(Some(SYSTEM_PROMPT), &prompt).await?;
        Self::parse_plan(&completion.text)
    }
}
