//! Approval gate
//!
//! Decides whether a plan (or an individual step) needs a human sign-off,
//! based on the assigned actor's trust score and the plan's risk level.
//! High risk always gates, whatever the trust: trust lowers uncertainty,
//! not consequence.

pub mod human;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ApprovalConfig;
use crate::planning::types::{Plan, Step, StepKind, MAX_AUTONOMY_LEVEL};

pub use human::{
    ApprovalRequest, ApprovalService, ApprovalVerdict, AutoApprove, ConsoleApprover,
    PendingApprovals,
};

/// Actor id used when a plan names no actor at all
pub const UNASSIGNED_ACTOR: &str = "unassigned";

/// Execution history of one actor, as read from the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    /// Executions inside the recent window
    pub recent_executions: u64,
    pub recent_successes: u64,
}

impl ActorStats {
    pub fn success_rate(&self) -> f64 {
        ratio(self.successful_executions, self.total_executions)
    }

    /// No recent executions counts as a recent rate of 0
    pub fn recent_success_rate(&self) -> f64 {
        ratio(self.recent_successes, self.recent_executions)
    }

    /// `0.6 * success rate + 0.2 * min(1, total/100) + 0.2 * recent success rate`
    pub fn trust_score(&self) -> f64 {
        let volume = (self.total_executions as f64 / 100.0).min(1.0);
        (0.6 * self.success_rate() + 0.2 * volume + 0.2 * self.recent_success_rate())
            .clamp(0.0, 1.0)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl RiskBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "low",
            RiskBand::Medium => "medium",
            RiskBand::High => "high",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            RiskBand::Low => "🟢",
            RiskBand::Medium => "🟡",
            RiskBand::High => "🔴",
        }
    }
}

/// Why the gate decided the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    HighRisk,
    InsufficientTrust,
    TrustedActor,
    ManualOversight,
    HumanInterventionRequired,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::HighRisk => "high_risk",
            ReasonCode::InsufficientTrust => "insufficient_trust",
            ReasonCode::TrustedActor => "trusted_actor",
            ReasonCode::ManualOversight => "manual_oversight",
            ReasonCode::HumanInterventionRequired => "human_intervention_required",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the gate together with everything needed to audit it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub requires_approval: bool,
    pub actor_id: String,
    /// Trust as computed from history
    pub trust: f64,
    /// Trust used for the decision (0 on cold start)
    pub effective_trust: f64,
    pub cold_start: bool,
    pub risk: f64,
    pub risk_band: RiskBand,
    pub reason: ReasonCode,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Trust/risk driven approval decisions. Pure reads: no locking, no store access.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    config: ApprovalConfig,
    keywords: Vec<Regex>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        let keywords = config
            .high_risk_keywords
            .iter()
            .filter_map(|kw| Regex::new(&format!(r"(?i)\b{}", regex::escape(kw))).ok())
            .collect();
        Self { config, keywords }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Returns `(raw trust, effective trust, cold start)`
    pub fn trust(&self, stats: &ActorStats) -> (f64, f64, bool) {
        let raw = stats.trust_score();
        let cold_start = stats.total_executions < self.config.min_executions;
        let effective = if cold_start { 0.0 } else { raw };
        (raw, effective, cold_start)
    }

    /// Risk level of a plan in [0, 1]
    pub fn risk_level(&self, plan: &Plan) -> f64 {
        let steps = (plan.steps.len() as f64 / 10.0).min(1.0) * 0.25;

        let hits = self
            .keywords
            .iter()
            .filter(|re| plan.steps.iter().any(|s| re.is_match(&s.description)))
            .count();
        let keywords = (hits as f64 * 0.15).min(0.45);

        let flagged = plan.steps.iter().filter(|s| s.approval_required).count();
        let flagged = (flagged as f64 * 0.1).min(0.2);

        let gates = if plan.steps.iter().any(|s| s.kind.is_gate()) {
            0.1
        } else {
            0.0
        };

        (steps + keywords + flagged + gates).clamp(0.0, 1.0)
    }

    pub fn band(&self, risk: f64) -> RiskBand {
        if risk >= self.config.high_risk_threshold {
            RiskBand::High
        } else if risk >= self.config.medium_risk_threshold {
            RiskBand::Medium
        } else {
            RiskBand::Low
        }
    }

    /// Decide whether `plan` needs a human sign-off before it runs.
    ///
    /// `task_risk` overrides the computed risk when the caller already knows it.
    pub fn should_require_approval(
        &self,
        plan: &Plan,
        actor_id: &str,
        stats: &ActorStats,
        task_risk: Option<f64>,
        autonomy_level: u8,
    ) -> ApprovalDecision {
        let risk = task_risk
            .map(|r| r.clamp(0.0, 1.0))
            .unwrap_or_else(|| self.risk_level(plan));
        let (trust, effective_trust, cold_start) = self.trust(stats);
        let risk_band = self.band(risk);

        let (requires_approval, reason) = match risk_band {
            RiskBand::High => (true, ReasonCode::HighRisk),
            _ if autonomy_level == 0 => (true, ReasonCode::ManualOversight),
            RiskBand::Medium if effective_trust < self.config.medium_risk_min_trust => {
                (true, ReasonCode::InsufficientTrust)
            }
            RiskBand::Low if effective_trust < self.config.low_risk_min_trust => {
                (true, ReasonCode::InsufficientTrust)
            }
            _ => (false, ReasonCode::TrustedActor),
        };

        tracing::info!(
            "Approval gate for plan {} (actor {}): trust={:.2} effective={:.2} risk={:.2} ({}) -> {} [{}]",
            plan.id,
            actor_id,
            trust,
            effective_trust,
            risk,
            risk_band.as_str(),
            if requires_approval { "approval required" } else { "auto-approve" },
            reason
        );

        ApprovalDecision {
            requires_approval,
            actor_id: actor_id.to_string(),
            trust,
            effective_trust,
            cold_start,
            risk,
            risk_band,
            reason,
            decided_at: Utc::now(),
        }
    }

    /// Mandatory human sign-off after an escalation, regardless of trust and risk
    pub fn forced(&self, plan: &Plan, actor_id: &str, stats: &ActorStats) -> ApprovalDecision {
        let risk = self.risk_level(plan);
        let (trust, effective_trust, cold_start) = self.trust(stats);
        tracing::info!(
            "Approval forced for plan {} after human intervention",
            plan.id
        );
        ApprovalDecision {
            requires_approval: true,
            actor_id: actor_id.to_string(),
            trust,
            effective_trust,
            cold_start,
            risk,
            risk_band: self.band(risk),
            reason: ReasonCode::HumanInterventionRequired,
            decided_at: Utc::now(),
        }
    }

    /// Whether a step blocks on a human before running.
    ///
    /// `approval` steps always do. `approval_required` actions are waived at
    /// maximum autonomy when the actor is trusted.
    pub fn step_requires_approval(
        &self,
        step: &Step,
        stats: &ActorStats,
        autonomy_level: u8,
    ) -> bool {
        match step.kind {
            StepKind::Approval { .. } => true,
            _ if !step.approval_required => false,
            _ => {
                let (_, effective, _) = self.trust(stats);
                !(autonomy_level >= MAX_AUTONOMY_LEVEL
                    && effective >= self.config.medium_risk_min_trust)
            }
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(ApprovalConfig::default())
    }
}

/// The actor whose trust decides for the whole plan: the least trusted one
pub fn deciding_actor(
    plan: &Plan,
    stats: impl Fn(&str) -> ActorStats,
) -> (String, ActorStats) {
    plan.actors()
        .into_iter()
        .map(|a| (a.id.clone(), stats(&a.id)))
        .min_by(|(_, a), (_, b)| {
            a.trust_score()
                .partial_cmp(&b.trust_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or_else(|| (UNASSIGNED_ACTOR.to_string(), stats(UNASSIGNED_ACTOR)))
}
