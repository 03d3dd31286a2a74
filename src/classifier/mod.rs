//! Error classification
//!
//! Maps a raw failure message to a severity and category using ordered
//! rule tables: CRITICAL rules first, then HIGH, then the timeout rules
//! (whose severity depends on how often the step has timed out before),
//! then MEDIUM and LOW. The first matching rule wins. Anything unmatched is
//! UNKNOWN / LOW.

mod rules;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ClassifierConfig;

pub use rules::{Rule, BUILTIN_RULES, TIMEOUT_PATTERNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Environment,
    Dependency,
    Validation,
    Logic,
    Timeout,
    Resource,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Environment => "ENVIRONMENT",
            ErrorCategory::Dependency => "DEPENDENCY",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Logic => "LOGIC",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure happened
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub plan_id: Option<String>,
    pub step_id: Option<String>,
    /// Execution attempt of the step (1-based)
    #[serde(default)]
    pub attempt: u32,
    /// Earlier timeouts recorded for the same step
    #[serde(default)]
    pub timeout_count: u32,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl ErrorContext {
    pub fn for_step(plan_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            step_id: Some(step_id.into()),
            attempt: 1,
            ..Default::default()
        }
    }

    pub fn for_plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            ..Default::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_timeout_count(mut self, count: u32) -> Self {
        self.timeout_count = count;
        self
    }
}

/// A failure after classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub severity: Severity,
    pub category: ErrorCategory,
    pub requires_replanning: bool,
    pub message: String,
    pub context: ErrorContext,
}

impl ClassifiedError {
    pub fn is_timeout(&self) -> bool {
        self.category == ErrorCategory::Timeout
    }

    /// CRITICAL or HIGH, regardless of whether replanning is enabled
    pub fn is_severe(&self) -> bool {
        self.severity >= Severity::High
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.severity, self.category, self.message)
    }
}

/// Classifies failure messages. Pure: no state changes between calls.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
    /// Operator rules compiled from configuration
    extra: Vec<Rule>,
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let extra = config
            .extra_patterns
            .iter()
            .filter_map(|p| match Rule::new(&p.pattern, p.category, p.severity) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!("Ignoring invalid classifier pattern {:?}: {}", p.pattern, e);
                    None
                }
            })
            .collect();

        Self { config, extra }
    }

    pub fn classify(&self, message: &str, context: ErrorContext) -> ClassifiedError {
        let (severity, category) = self.match_tables(message, &context);
        let requires_replanning = match severity {
            Severity::Critical => self.config.replan_on_critical,
            Severity::High => self.config.replan_on_high,
            Severity::Medium | Severity::Low => false,
        };

        tracing::debug!(
            "Classified {:?} as {}/{} (replan: {})",
            message,
            severity,
            category,
            requires_replanning
        );

        ClassifiedError {
            severity,
            category,
            requires_replanning,
            message: message.to_string(),
            context,
        }
    }

    fn match_tables(&self, message: &str, context: &ErrorContext) -> (Severity, ErrorCategory) {
        for tier in [Severity::Critical, Severity::High] {
            if let Some(rule) = self.first_match(tier, message) {
                return (rule.severity, rule.category);
            }
        }

        if TIMEOUT_PATTERNS.iter().any(|re| re.is_match(message)) {
            let severity = if context.timeout_count >= self.config.timeout_repeat_threshold {
                Severity::Critical
            } else {
                Severity::Medium
            };
            return (severity, ErrorCategory::Timeout);
        }

        for tier in [Severity::Medium, Severity::Low] {
            if let Some(rule) = self.first_match(tier, message) {
                return (rule.severity, rule.category);
            }
        }

        (Severity::Low, ErrorCategory::Unknown)
    }

    /// Operator rules of a tier are consulted before built-in ones
    fn first_match(&self, tier: Severity, message: &str) -> Option<&Rule> {
        self.extra
            .iter()
            .chain(BUILTIN_RULES.iter())
            .filter(|rule| rule.severity == tier)
            .find(|rule| rule.is_match(message))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternRule;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::default()
    }

    #[test]
    fn test_empty_plan_is_critical_logic() {
        let err = classifier().classify("Plan has no steps", ErrorContext::default());
        assert_eq!(err.severity, Severity::Critical);
        assert_eq!(err.category, ErrorCategory::Logic);
        assert!(err.requires_replanning);
    }

    #[test]
    fn test_timeout_escalates_on_repeat() {
        let c = classifier();
        let first = c.classify(
            "Step execution timeout",
            ErrorContext::for_step("p", "s1"),
        );
        assert_eq!(first.severity, Severity::Medium);
        assert_eq!(first.category, ErrorCategory::Timeout);
        assert!(!first.requires_replanning);

        let second = c.classify(
            "Step execution timeout",
            ErrorContext::for_step("p", "s1").with_timeout_count(1),
        );
        assert_eq!(second.severity, Severity::Critical);
        assert!(second.requires_replanning);
    }

    #[test]
    fn test_unmatched_is_unknown_low() {
        let err = classifier().classify("something odd happened", ErrorContext::default());
        assert_eq!(err.severity, Severity::Low);
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert!(!err.requires_replanning);
    }

    #[test]
    fn test_critical_checked_before_high() {
        // "permission denied" is CRITICAL even though "connection" rules are HIGH
        let err = classifier().classify(
            "connection refused: permission denied",
            ErrorContext::default(),
        );
        assert_eq!(err.severity, Severity::Critical);
        assert_eq!(err.category, ErrorCategory::Environment);
    }

    #[test]
    fn test_structural_messages() {
        let c = classifier();
        for msg in [
            "Cyclic dependency between steps: a, b",
            "Missing dependency 'x' referenced by step 'y'",
            "Duplicate step id 'a'",
        ] {
            let err = c.classify(msg, ErrorContext::default());
            assert_eq!(err.severity, Severity::Critical, "{}", msg);
            assert_eq!(err.category, ErrorCategory::Logic, "{}", msg);
        }
    }

    #[test]
    fn test_high_severity_can_be_disabled() {
        let config = ClassifierConfig {
            replan_on_high: false,
            ..Default::default()
        };
        let c = ErrorClassifier::new(config);

        let high = c.classify("Connection refused by upstream", ErrorContext::default());
        assert_eq!(high.severity, Severity::High);
        assert!(!high.requires_replanning);

        let critical = c.classify("Out of memory", ErrorContext::default());
        assert!(critical.requires_replanning);
    }

    #[test]
    fn test_operator_rules_take_precedence_within_tier() {
        let config = ClassifierConfig {
            extra_patterns: vec![PatternRule {
                pattern: r"(?i)billing".to_string(),
                category: ErrorCategory::Resource,
                severity: Severity::Critical,
            }],
            ..Default::default()
        };
        let err = ErrorClassifier::new(config)
            .classify("Billing account suspended", ErrorContext::default());
        assert_eq!(err.severity, Severity::Critical);
        assert_eq!(err.category, ErrorCategory::Resource);
    }

    #[test]
    fn test_medium_and_low_rows() {
        let c = classifier();
        let err = c.classify("File not found: data.csv", ErrorContext::default());
        assert_eq!((err.severity, err.category), (Severity::Medium, ErrorCategory::Dependency));

        let err = c.classify("Resource temporarily busy, retry later", ErrorContext::default());
        assert_eq!(err.severity, Severity::Low);
    }
}
