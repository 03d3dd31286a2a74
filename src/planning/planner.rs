//! Plan generation
//!
//! Calls the decomposer once (or once per strategy variant), turns the
//! results into draft plans and, for alternatives, ranks them with the
//! evaluator.

use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EvaluationWeights;
use crate::decomposer::{DecomposedPlan, Decomposer, DecompositionContext};
use crate::error::EngineError;
use crate::evaluator::{Evaluation, PlanEvaluator};

use super::types::{context_keys, AlternativeMeta, Plan, StrategyVariant};

/// Builds draft plans from decomposer output
pub struct Planner {
    decomposer: Arc<dyn Decomposer>,
    evaluator: PlanEvaluator,
}

impl Planner {
    pub fn new(decomposer: Arc<dyn Decomposer>, evaluator: PlanEvaluator) -> Self {
        Self {
            decomposer,
            evaluator,
        }
    }

    pub fn evaluator(&self) -> &PlanEvaluator {
        &self.evaluator
    }

    /// One decomposition, one draft plan
    pub async fn create_plan(
        &self,
        description: &str,
        version: u32,
        context: &DecompositionContext,
    ) -> Result<Plan> {
        let body = self
            .decomposer
            .decompose(description, context)
            .await
            .map_err(|e| EngineError::Decomposition(format!("{:#}", e)))?;

        let mut plan = plan_from(&context.task_id, version, body);
        let evaluation = self.evaluator.evaluate(&plan);
        record_evaluation(&mut plan, &evaluation);

        tracing::info!(
            "Planned task {} v{}: {} steps, score {:.2}",
            context.task_id,
            version,
            plan.steps.len(),
            evaluation.total
        );
        Ok(plan)
    }

    /// Decompose once per strategy variant and rank the results, best first.
    ///
    /// Variants whose decomposition fails are dropped; it is an error only if
    /// every variant fails.
    pub async fn create_alternatives(
        &self,
        description: &str,
        version: u32,
        context: &DecompositionContext,
    ) -> Result<Vec<Plan>> {
        let weights = *self.evaluator.weights();
        self.create_alternatives_with(description, version, context, &weights)
            .await
    }

    /// As [`Planner::create_alternatives`], ranked under the given weights
    pub async fn create_alternatives_with(
        &self,
        description: &str,
        version: u32,
        context: &DecompositionContext,
        weights: &EvaluationWeights,
    ) -> Result<Vec<Plan>> {
        let attempts = join_all(StrategyVariant::all().iter().map(|&variant| {
            let context = context.clone().with_variant(variant);
            async move {
                let result = self.decomposer.decompose(description, &context).await;
                (variant, result)
            }
        }))
        .await;

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for (variant, result) in attempts {
            match result {
                Ok(body) => {
                    let mut plan = plan_from(&context.task_id, version, body);
                    plan.alternative = Some(AlternativeMeta {
                        strategy: variant,
                        score: 0.0,
                        rank: 0,
                        is_best: false,
                    });
                    candidates.push(plan);
                }
                Err(e) => {
                    tracing::warn!("{} variant for task {} failed: {:#}", variant, context.task_id, e);
                    failures.push(format!("{}: {:#}", variant, e));
                }
            }
        }

        if candidates.is_empty() {
            return Err(EngineError::Decomposition(failures.join("; ")).into());
        }

        let ranking: Vec<(String, Evaluation)> = self
            .evaluator
            .evaluate_many_with(&candidates, weights)
            .into_iter()
            .map(|(plan, evaluation)| (plan.id.clone(), evaluation))
            .collect();
        let mut by_id: HashMap<String, Plan> =
            candidates.into_iter().map(|p| (p.id.clone(), p)).collect();

        let mut ranked = Vec::with_capacity(ranking.len());
        for (position, (id, evaluation)) in ranking.into_iter().enumerate() {
            let Some(mut plan) = by_id.remove(&id) else {
                continue;
            };
            if let Some(meta) = plan.alternative.as_mut() {
                meta.score = evaluation.total;
                meta.rank = position + 1;
                meta.is_best = position == 0;
                tracing::info!(
                    "Alternative #{} for task {}: {} ({} steps, score {:.2})",
                    meta.rank,
                    context.task_id,
                    meta.strategy,
                    plan.steps.len(),
                    meta.score
                );
            }
            record_evaluation(&mut plan, &evaluation);
            ranked.push(plan);
        }
        Ok(ranked)
    }
}

/// Draft plan from a decomposition. Step execution state is cleared.
pub fn plan_from(task_id: &str, version: u32, body: DecomposedPlan) -> Plan {
    let mut steps = body.steps;
    for step in &mut steps {
        step.reset();
    }
    let mut plan = Plan::new(task_id, version, body.goal)
        .with_strategy(body.strategy)
        .with_steps(steps);
    plan.estimated_duration_secs = body.estimated_duration_secs;
    plan
}

fn record_evaluation(plan: &mut Plan, evaluation: &Evaluation) {
    if let Ok(value) = serde_json::to_value(evaluation) {
        plan.context
            .insert(context_keys::EVALUATION.to_string(), value);
    }
}
