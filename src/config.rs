use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{ErrorCategory, Severity};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub replanning: ReplanningConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub actors: ActorsConfig,
}

/// An operator-supplied classification rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    /// Case-insensitive regex matched against the failure message
    pub pattern: String,
    pub category: ErrorCategory,
    pub severity: Severity,
}

/// Configuration for error classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Trigger replanning for CRITICAL failures (default: true)
    #[serde(default = "default_true")]
    pub replan_on_critical: bool,

    /// Trigger replanning for HIGH failures (default: true)
    #[serde(default = "default_true")]
    pub replan_on_high: bool,

    /// Earlier timeouts of the same step at which a timeout becomes CRITICAL (default: 1)
    #[serde(default = "default_timeout_repeat_threshold")]
    pub timeout_repeat_threshold: u32,

    /// Extra rules, checked ahead of the built-in rules of the same severity
    #[serde(default)]
    pub extra_patterns: Vec<PatternRule>,
}

fn default_timeout_repeat_threshold() -> u32 {
    1
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            replan_on_critical: true,
            replan_on_high: true,
            timeout_repeat_threshold: default_timeout_repeat_threshold(),
            extra_patterns: Vec::new(),
        }
    }
}

/// Relative importance of each evaluation criterion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationWeights {
    pub execution_time: f64,
    pub approval_points: f64,
    pub risk: f64,
    pub step_efficiency: f64,
}

impl Default for EvaluationWeights {
    fn default() -> Self {
        Self {
            execution_time: 0.25,
            approval_points: 0.20,
            risk: 0.25,
            step_efficiency: 0.30,
        }
    }
}

/// Configuration for plan evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default)]
    pub weights: EvaluationWeights,

    /// Plans estimated at or above this duration score 0 on execution time (default: 3600)
    #[serde(default = "default_duration_ceiling")]
    pub duration_ceiling_secs: u64,

    /// Estimate used for steps that carry none (default: 60)
    #[serde(default = "default_step_estimate")]
    pub default_step_estimate_secs: u64,

    /// Approval points at which the approval criterion bottoms out (default: 5)
    #[serde(default = "default_max_approval_points")]
    pub max_approval_points: usize,
}

fn default_duration_ceiling() -> u64 {
    3600
}

fn default_step_estimate() -> u64 {
    60
}

fn default_max_approval_points() -> usize {
    5
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            weights: EvaluationWeights::default(),
            duration_ceiling_secs: default_duration_ceiling(),
            default_step_estimate_secs: default_step_estimate(),
            max_approval_points: default_max_approval_points(),
        }
    }
}

/// Configuration for the trust/risk approval gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Actors with fewer recorded executions are treated as untrusted (default: 5)
    #[serde(default = "default_min_executions")]
    pub min_executions: u64,

    #[serde(default = "default_high_risk")]
    pub high_risk_threshold: f64,

    #[serde(default = "default_medium_risk")]
    pub medium_risk_threshold: f64,

    /// Trust needed to auto-approve a medium risk plan (default: 0.8)
    #[serde(default = "default_medium_risk_min_trust")]
    pub medium_risk_min_trust: f64,

    /// Trust needed to auto-approve a low risk plan (default: 0.5)
    #[serde(default = "default_low_risk_min_trust")]
    pub low_risk_min_trust: f64,

    /// Window used for the recent success rate (default: 30 days)
    #[serde(default = "default_recent_window_days")]
    pub recent_window_days: i64,

    /// Words in step descriptions that raise a plan's risk
    #[serde(default = "default_high_risk_keywords")]
    pub high_risk_keywords: Vec<String>,
}

fn default_min_executions() -> u64 {
    5
}

fn default_high_risk() -> f64 {
    0.7
}

fn default_medium_risk() -> f64 {
    0.4
}

fn default_medium_risk_min_trust() -> f64 {
    0.8
}

fn default_low_risk_min_trust() -> f64 {
    0.5
}

fn default_recent_window_days() -> i64 {
    30
}

fn default_high_risk_keywords() -> Vec<String> {
    ["delete", "drop", "format", "execute", "system", "shell"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            min_executions: default_min_executions(),
            high_risk_threshold: default_high_risk(),
            medium_risk_threshold: default_medium_risk(),
            medium_risk_min_trust: default_medium_risk_min_trust(),
            low_risk_min_trust: default_low_risk_min_trust(),
            recent_window_days: default_recent_window_days(),
            high_risk_keywords: default_high_risk_keywords(),
        }
    }
}

/// What happens to the rest of a plan when a MEDIUM or LOW failure occurs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediumFailurePolicy {
    /// Stop scheduling and fail the plan
    #[default]
    FailPlan,
    /// Keep running steps that do not depend on the failed one
    ContinueIndependent,
}

/// Configuration for plan execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Timeout applied to every step invocation (default: 300)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// How often in-flight invocations check for cancellation (default: 250ms)
    #[serde(default = "default_cancel_poll_interval")]
    pub cancel_poll_interval_ms: u64,

    /// Ready steps started together in one scheduling round (default: 1)
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    #[serde(default)]
    pub medium_failure_policy: MediumFailurePolicy,

    /// Fail the whole plan when a validation step fails (default: false)
    #[serde(default)]
    pub validation_failure_fails_plan: bool,

    /// Give up waiting on a human, for plan and step approvals alike, after
    /// this long; unset waits until cancelled
    #[serde(default)]
    pub approval_wait_timeout_secs: Option<u64>,
}

fn default_step_timeout() -> u64 {
    300
}

fn default_cancel_poll_interval() -> u64 {
    250
}

fn default_max_parallel_steps() -> usize {
    1
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms.max(1))
    }

    pub fn approval_wait_timeout(&self) -> Option<Duration> {
        self.approval_wait_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            cancel_poll_interval_ms: default_cancel_poll_interval(),
            max_parallel_steps: default_max_parallel_steps(),
            medium_failure_policy: MediumFailurePolicy::default(),
            validation_failure_fails_plan: false,
            approval_wait_timeout_secs: None,
        }
    }
}

/// Bounds on automatic recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanningConfig {
    /// Replans allowed per task before escalating (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Minimum time between two replans of the same task (default: 5)
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Timeout for producing one replacement plan (default: 300)
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Consecutive failed attempts that force human intervention (default: 5)
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,

    /// Generate conservative/balanced/aggressive variants and keep the best
    #[serde(default)]
    pub generate_alternatives: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_interval() -> u64 {
    5
}

fn default_attempt_timeout() -> u64 {
    300
}

fn default_escalation_threshold() -> u32 {
    5
}

impl ReplanningConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl Default for ReplanningConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_interval_secs: default_min_interval(),
            attempt_timeout_secs: default_attempt_timeout(),
            escalation_threshold: default_escalation_threshold(),
            generate_alternatives: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file; defaults to the config directory
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl PersistenceConfig {
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::config_dir()?.join("planwright.db")),
        }
    }
}

/// Text-generation endpoint used by the LLM decomposer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API, e.g. "http://localhost:8000/v1"
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> usize {
    4096
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Built-in actors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorsConfig {
    /// Register the `shell` actor
    #[serde(default = "default_true")]
    pub shell_enabled: bool,
    /// Working directory for shell commands (defaults to the current directory)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Commands matching any of these regexes are refused
    #[serde(default = "default_dangerous_patterns")]
    pub dangerous_patterns: Vec<String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_dangerous_patterns() -> Vec<String> {
    vec![
        r"rm\s+-rf\s+/".to_string(),
        r"rm\s+-rf\s+~".to_string(),
        r":\(\)\s*\{\s*:\|:&\s*\}".to_string(), // Fork bomb
        r"dd\s+if=.*of=/dev/".to_string(),
        r"mkfs\.".to_string(),
        r">\s*/dev/sd".to_string(),
        r"chmod\s+-R\s+777\s+/".to_string(),
    ]
}

fn default_max_output_bytes() -> usize {
    1_048_576 // 1MB
}

impl Default for ActorsConfig {
    fn default() -> Self {
        Self {
            shell_enabled: true,
            working_dir: None,
            dangerous_patterns: default_dangerous_patterns(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("planwright"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Reject values that would make the engine misbehave silently
    pub fn validate(&self) -> Result<()> {
        let w = &self.evaluator.weights;
        for (name, value) in [
            ("execution_time", w.execution_time),
            ("approval_points", w.approval_points),
            ("risk", w.risk),
            ("step_efficiency", w.step_efficiency),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("evaluator weight {} must be within [0, 1], got {}", name, value);
            }
        }

        if self.approval.medium_risk_threshold > self.approval.high_risk_threshold {
            anyhow::bail!("approval.medium_risk_threshold must not exceed high_risk_threshold");
        }

        if self.executor.max_parallel_steps == 0 {
            anyhow::bail!("executor.max_parallel_steps must be at least 1");
        }

        for pattern in &self.actors.dangerous_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid dangerous command pattern: {}", pattern))?;
        }

        for rule in &self.classifier.extra_patterns {
            regex::Regex::new(&rule.pattern)
                .with_context(|| format!("Invalid classifier pattern: {}", rule.pattern))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.replanning.max_attempts, 3);
        assert_eq!(config.replanning.min_interval_secs, 5);
        assert_eq!(config.replanning.attempt_timeout_secs, 300);
        assert_eq!(config.replanning.escalation_threshold, 5);
        assert_eq!(config.approval.min_executions, 5);
        assert_eq!(config.executor.medium_failure_policy, MediumFailurePolicy::FailPlan);
        assert!(config.classifier.replan_on_high);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [replanning]
            max_attempts = 7

            [executor]
            medium_failure_policy = "continue_independent"

            [[classifier.extra_patterns]]
            pattern = "quota"
            category = "RESOURCE"
            severity = "HIGH"
            "#,
        )
        .unwrap();

        assert_eq!(config.replanning.max_attempts, 7);
        assert_eq!(config.replanning.min_interval_secs, 5);
        assert_eq!(
            config.executor.medium_failure_policy,
            MediumFailurePolicy::ContinueIndependent
        );
        assert_eq!(config.classifier.extra_patterns.len(), 1);
        assert_eq!(config.classifier.extra_patterns[0].severity, Severity::High);
        assert_eq!(config.evaluator.weights, EvaluationWeights::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.evaluator.weights.risk = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executor.max_parallel_steps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.classifier.extra_patterns.push(PatternRule {
            pattern: "(unclosed".to_string(),
            category: ErrorCategory::Logic,
            severity: Severity::High,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.replanning.max_attempts = 9;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.replanning.max_attempts, 9);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/planwright.toml")).unwrap();
        assert_eq!(config.replanning.max_attempts, 3);
    }
}
