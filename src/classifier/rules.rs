//! Built-in classification tables
//!
//! Order matters: within a severity tier the first matching rule wins.

use lazy_static::lazy_static;
use regex::Regex;

use super::{ErrorCategory, Severity};

/// One row of a classification table
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    pub category: ErrorCategory,
    pub severity: Severity,
}

impl Rule {
    /// Patterns are matched case-insensitively
    pub fn new(
        pattern: &str,
        category: ErrorCategory,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        let pattern = if pattern.starts_with("(?i)") {
            Regex::new(pattern)?
        } else {
            Regex::new(&format!("(?i){}", pattern))?
        };
        Ok(Self {
            pattern,
            category,
            severity,
        })
    }

    pub fn is_match(&self, message: &str) -> bool {
        self.pattern.is_match(message)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

const BUILTIN_TABLE: &[(&str, ErrorCategory, Severity)] = &[
    // CRITICAL
    (r"no steps", ErrorCategory::Logic, Severity::Critical),
    (r"cyclic dependency|dependency cycle", ErrorCategory::Logic, Severity::Critical),
    (r"missing dependency|unknown dependency", ErrorCategory::Logic, Severity::Critical),
    (r"duplicate step", ErrorCategory::Logic, Severity::Critical),
    (r"out of memory|disk full|no space left", ErrorCategory::Resource, Severity::Critical),
    (r"permission denied|unauthorized|forbidden", ErrorCategory::Environment, Severity::Critical),
    (r"(actor|agent|tool) not found", ErrorCategory::Dependency, Severity::Critical),
    // HIGH
    (r"connection (refused|reset)|network unreachable|\bdns\b", ErrorCategory::Environment, Severity::High),
    (r"service unavailable|bad gateway|dependency .*failed", ErrorCategory::Dependency, Severity::High),
    (r"validation failed|invalid input|schema|approval rejected", ErrorCategory::Validation, Severity::High),
    (r"rate limit|quota exceeded|too many requests", ErrorCategory::Resource, Severity::High),
    (r"assertion failed|invariant violated", ErrorCategory::Logic, Severity::High),
    // MEDIUM
    (r"not found", ErrorCategory::Dependency, Severity::Medium),
    // LOW
    (r"retry|temporarily", ErrorCategory::Environment, Severity::Low),
];

const TIMEOUT_TABLE: &[&str] = &[r"timeout", r"timed out", r"deadline exceeded"];

lazy_static! {
    pub static ref BUILTIN_RULES: Vec<Rule> = BUILTIN_TABLE
        .iter()
        .filter_map(|(pattern, category, severity)| Rule::new(pattern, *category, *severity).ok())
        .collect();
    pub static ref TIMEOUT_PATTERNS: Vec<Regex> = TIMEOUT_TABLE
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
        .collect();
}
