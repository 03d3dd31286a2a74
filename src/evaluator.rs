//! Plan evaluation
//!
//! Scores a candidate plan on four weighted criteria and ranks alternatives.
//! Every criterion is normalized so that 1.0 is best.

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalGate;
use crate::config::{EvaluationWeights, EvaluatorConfig};
use crate::planning::types::Plan;

/// Per-criterion scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriterionScores {
    pub execution_time: f64,
    pub approval_points: f64,
    pub risk: f64,
    pub step_efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub scores: CriterionScores,
    /// Weighted sum, clamped to [0, 1]
    pub total: f64,
    /// Raw risk level (lower is better), kept for tie-breaking
    pub risk_level: f64,
    pub step_count: usize,
    pub recommendations: Vec<String>,
}

/// Scores plans. Weights can be overridden per call without touching shared state.
#[derive(Debug, Clone)]
pub struct PlanEvaluator {
    config: EvaluatorConfig,
    gate: ApprovalGate,
}

impl PlanEvaluator {
    pub fn new(config: EvaluatorConfig, gate: ApprovalGate) -> Self {
        Self { config, gate }
    }

    /// Configured default weights
    pub fn weights(&self) -> &EvaluationWeights {
        &self.config.weights
    }

    pub fn evaluate(&self, plan: &Plan) -> Evaluation {
        self.evaluate_with(plan, &self.config.weights)
    }

    pub fn evaluate_with(&self, plan: &Plan, weights: &EvaluationWeights) -> Evaluation {
        let estimate = plan.estimated_secs(self.config.default_step_estimate_secs);
        let approvals = plan.approval_points();
        let risk_level = self.gate.risk_level(plan);
        let steps = plan.steps.len();

        let scores = CriterionScores {
            execution_time: self.time_score(estimate),
            approval_points: self.approval_score(approvals),
            risk: 1.0 - risk_level,
            step_efficiency: step_efficiency(steps),
        };

        let total = (scores.execution_time * weights.execution_time
            + scores.approval_points * weights.approval_points
            + scores.risk * weights.risk
            + scores.step_efficiency * weights.step_efficiency)
            .clamp(0.0, 1.0);

        let recommendations = self.recommendations(plan, &scores, estimate, approvals, risk_level);

        tracing::debug!(
            "Evaluated plan {} v{}: total={:.3} (time={:.2} approvals={:.2} risk={:.2} steps={:.2})",
            plan.id,
            plan.version,
            total,
            scores.execution_time,
            scores.approval_points,
            scores.risk,
            scores.step_efficiency
        );

        Evaluation {
            scores,
            total,
            risk_level,
            step_count: steps,
            recommendations,
        }
    }

    /// Evaluate and sort best-first. Ties go to lower risk, then fewer steps.
    pub fn evaluate_many<'a>(&self, plans: &'a [Plan]) -> Vec<(&'a Plan, Evaluation)> {
        self.evaluate_many_with(plans, &self.config.weights)
    }

    pub fn evaluate_many_with<'a>(
        &self,
        plans: &'a [Plan],
        weights: &EvaluationWeights,
    ) -> Vec<(&'a Plan, Evaluation)> {
        let mut ranked: Vec<(&Plan, Evaluation)> = plans
            .iter()
            .map(|p| (p, self.evaluate_with(p, weights)))
            .collect();
        ranked.sort_by(|(_, a), (_, b)| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.risk_level
                        .partial_cmp(&b.risk_level)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.step_count.cmp(&b.step_count))
        });
        ranked
    }

    fn time_score(&self, estimate_secs: u64) -> f64 {
        if self.config.duration_ceiling_secs == 0 {
            return 0.0;
        }
        1.0 - (estimate_secs as f64 / self.config.duration_ceiling_secs as f64).min(1.0)
    }

    fn approval_score(&self, approvals: usize) -> f64 {
        let max = self.config.max_approval_points.max(1);
        1.0 - approvals.min(max) as f64 / max as f64
    }

    fn recommendations(
        &self,
        plan: &Plan,
        scores: &CriterionScores,
        estimate_secs: u64,
        approvals: usize,
        risk_level: f64,
    ) -> Vec<String> {
        let mut out = Vec::new();
        let steps = plan.steps.len();

        if steps == 0 {
            out.push("Plan has no steps".to_string());
            return out;
        }
        if steps <= 2 {
            out.push("Consider breaking the work into more granular steps".to_string());
        } else if steps > 10 {
            out.push(format!(
                "{} steps is a lot; merge related steps or split the task",
                steps
            ));
        }
        if scores.execution_time < 0.5 {
            out.push(format!(
                "Estimated duration of {}s is long; look for steps that can run in parallel",
                estimate_secs
            ));
        }
        if approvals > 2 {
            out.push(format!(
                "{} approval points will slow execution; batch approvals where possible",
                approvals
            ));
        }
        if self.gate.band(risk_level) != crate::approval::RiskBand::Low {
            out.push("Add validation steps before destructive operations".to_string());
        }
        out
    }
}

impl Default for PlanEvaluator {
    fn default() -> Self {
        Self::new(EvaluatorConfig::default(), ApprovalGate::default())
    }
}

/// Bell-shaped score peaking for 3-7 steps
pub fn step_efficiency(steps: usize) -> f64 {
    match steps {
        0 => 0.0,
        1 => 0.4,
        2 => 0.7,
        3..=7 => 1.0,
        8 => 0.9,
        9 => 0.8,
        10 => 0.7,
        n => (0.6 - 0.05 * (n - 10) as f64).max(0.1),
    }
}
