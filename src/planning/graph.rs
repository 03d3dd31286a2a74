//! Structural checks over a plan's step graph
//!
//! Messages produced here are matched by the classifier's CRITICAL table, so
//! their wording is part of the contract.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::types::{Plan, StepStatus};

/// Why a plan cannot be executed at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralIssue {
    NoSteps,
    DuplicateStep(String),
    MissingDependency { step: String, dependency: String },
    Cycle(Vec<String>),
}

impl std::fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralIssue::NoSteps => write!(f, "Plan has no steps"),
            StructuralIssue::DuplicateStep(id) => write!(f, "Duplicate step id '{}'", id),
            StructuralIssue::MissingDependency { step, dependency } => write!(
                f,
                "Missing dependency '{}' referenced by step '{}'",
                dependency, step
            ),
            StructuralIssue::Cycle(ids) => {
                write!(f, "Cyclic dependency between steps: {}", ids.join(", "))
            }
        }
    }
}

/// Check that the plan is non-empty, ids are unique, every dependency exists
/// and the dependency graph is acyclic.
pub fn validate(plan: &Plan) -> Result<(), StructuralIssue> {
    if plan.steps.is_empty() {
        return Err(StructuralIssue::NoSteps);
    }

    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(StructuralIssue::DuplicateStep(step.id.clone()));
        }
    }

    for step in &plan.steps {
        for dep in &step.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(StructuralIssue::MissingDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let order = topological_order(plan);
    if order.len() < plan.steps.len() {
        let ordered: HashSet<&str> = order.iter().map(|s| s.as_str()).collect();
        let stuck = plan
            .steps
            .iter()
            .filter(|s| !ordered.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();
        return Err(StructuralIssue::Cycle(stuck));
    }

    Ok(())
}

/// Kahn's algorithm; ties are broken by plan order so the result is stable.
/// Steps caught in a cycle are left out.
pub fn topological_order(plan: &Plan) -> Vec<String> {
    let index: HashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; plan.steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.steps.len()];
    for (i, step) in plan.steps.iter().enumerate() {
        for dep in &step.dependencies {
            if let Some(&d) = index.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(plan.steps.len());

    while let Some(i) = ready.pop_first() {
        order.push(plan.steps[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    order
}

/// Indices of pending steps whose dependencies are all completed, in plan order
pub fn ready_steps(plan: &Plan) -> Vec<usize> {
    plan.steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status == StepStatus::Pending && plan.dependencies_met(s))
        .map(|(i, _)| i)
        .collect()
}

/// What happens to a pending step whose dependencies can no longer complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    /// A dependency failed: the step fails without starting
    Failed { dependency: String },
    /// A dependency was skipped: the step is skipped too
    Skipped { dependency: String },
}

/// Pending steps that can never start, with the reason. Failure wins over skip.
pub fn blocked_steps(plan: &Plan) -> Vec<(usize, Blocked)> {
    let mut blocked = Vec::new();
    for (i, step) in plan.steps.iter().enumerate() {
        if step.status != StepStatus::Pending {
            continue;
        }
        let mut skipped_dep = None;
        let mut failed_dep = None;
        for dep in &step.dependencies {
            match plan.step(dep).map(|s| s.status) {
                Some(StepStatus::Failed) if failed_dep.is_none() => failed_dep = Some(dep.clone()),
                Some(StepStatus::Skipped) if skipped_dep.is_none() => {
                    skipped_dep = Some(dep.clone())
                }
                _ => {}
            }
        }
        if let Some(dependency) = failed_dep {
            blocked.push((i, Blocked::Failed { dependency }));
        } else if let Some(dependency) = skipped_dep {
            blocked.push((i, Blocked::Skipped { dependency }));
        }
    }
    blocked
}
