//! Plans read from a JSON or TOML file
//!
//! The file holds the first plan and, optionally, a list of revisions used
//! for successive replans:
//!
//! ```toml
//! goal = "Publish the report"
//!
//! [[steps]]
//! id = "fetch"
//! description = "Fetch the data"
//! actor = { id = "shell", kind = "tool" }
//! invocation = { command = "curl -sf https://example.com/data.csv" }
//!
//! [[revisions]]
//! goal = "Publish the report from the cached copy"
//! # ...
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{DecomposedPlan, Decomposer, DecompositionContext};
use crate::planning::types::{ActorRef, Step, StepKind, Strategy};

#[derive(Debug, Clone, Deserialize)]
struct PlanFile {
    goal: String,
    #[serde(default)]
    strategy: Strategy,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    estimated_duration_secs: Option<u64>,
    #[serde(default)]
    revisions: Vec<DecomposedPlan>,
}

pub struct FileDecomposer {
    path: PathBuf,
    base: DecomposedPlan,
    revisions: Vec<DecomposedPlan>,
}

impl FileDecomposer {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        let file: PlanFile = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML plan {}", path.display()))?,
            _ => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON plan {}", path.display()))?,
        };

        Ok(Self {
            path: path.to_path_buf(),
            base: DecomposedPlan {
                goal: file.goal,
                strategy: file.strategy,
                steps: file.steps,
                estimated_duration_secs: file.estimated_duration_secs,
            },
            revisions: file.revisions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assign `actor` to every action step that names none
    pub fn with_default_actor(mut self, actor: ActorRef) -> Self {
        let bodies = std::iter::once(&mut self.base).chain(self.revisions.iter_mut());
        for step in bodies.flat_map(|body| body.steps.iter_mut()) {
            if step.actor.is_none() && step.kind == StepKind::Action {
                step.actor = Some(actor.clone());
            }
        }
        self
    }
}

#[async_trait]
impl Decomposer for FileDecomposer {
    /// The base plan first; revision N for replan attempt N, repeating the
    /// last revision once they run out
    async fn decompose(
        &self,
        _description: &str,
        context: &DecompositionContext,
    ) -> Result<DecomposedPlan> {
        let plan = match &context.replan {
            Some(replan) if !self.revisions.is_empty() => {
                let index = (replan.attempt.max(1) as usize - 1).min(self.revisions.len() - 1);
                &self.revisions[index]
            }
            _ => &self.base,
        };
        Ok(plan.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorClassifier, ErrorContext};
    use crate::decomposer::ReplanContext;
    use assert_fs::prelude::*;

    const TOML_PLAN: &str = r#"
goal = "Publish"

[[steps]]
id = "a"
description = "Fetch"

[[steps]]
id = "b"
description = "Render"
dependencies = ["a"]
kind = { type = "validation", condition = { kind = "always", value = true } }

[[revisions]]
goal = "Publish again"

[[revisions.steps]]
id = "b2"
description = "Render differently"
"#;

    fn replan(attempt: u32) -> ReplanContext {
        ReplanContext {
            attempt,
            error: ErrorClassifier::default().classify("boom", ErrorContext::default()),
            completed_steps: vec![],
            failure_history: vec![],
            previous_plan_id: "p".to_string(),
            previous_version: attempt,
            previous_goal: "Publish".to_string(),
        }
    }

    #[tokio::test]
    async fn test_toml_plan_and_revisions() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("plan.toml");
        file.write_str(TOML_PLAN).unwrap();

        let decomposer = FileDecomposer::load(file.path()).unwrap();
        let first = decomposer
            .decompose("", &DecompositionContext::new("t"))
            .await
            .unwrap();
        assert_eq!(first.goal, "Publish");
        assert_eq!(first.steps.len(), 2);
        assert_eq!(first.steps[1].kind.as_str(), "validation");

        let ctx = DecompositionContext::new("t").with_replan(replan(3));
        let revised = decomposer.decompose("", &ctx).await.unwrap();
        assert_eq!(revised.goal, "Publish again");
    }

    #[tokio::test]
    async fn test_json_plan() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("plan.json");
        file.write_str(r#"{"goal": "g", "steps": [{"id": "x", "description": "X"}]}"#)
            .unwrap();

        let decomposer = FileDecomposer::load(file.path()).unwrap();
        let ctx = DecompositionContext::new("t").with_replan(replan(1));
        // No revisions: replans get the base plan again
        let plan = decomposer.decompose("", &ctx).await.unwrap();
        assert_eq!(plan.steps[0].id, "x");
    }

    #[tokio::test]
    async fn test_default_actor_fills_action_steps() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("plan.toml");
        file.write_str(TOML_PLAN).unwrap();

        let decomposer = FileDecomposer::load(file.path())
            .unwrap()
            .with_default_actor(ActorRef::tool("echo"));
        let plan = decomposer
            .decompose("", &DecompositionContext::new("t"))
            .await
            .unwrap();
        assert_eq!(plan.steps[0].actor, Some(ActorRef::tool("echo")));
        // validation steps keep no actor
        assert!(plan.steps[1].actor.is_none());

        let ctx = DecompositionContext::new("t").with_replan(replan(1));
        let revised = decomposer.decompose("", &ctx).await.unwrap();
        assert_eq!(revised.steps[0].actor, Some(ActorRef::tool("echo")));
    }

    #[test]
    fn test_missing_file() {
        assert!(FileDecomposer::load(Path::new("/nonexistent/plan.json")).is_err());
    }
}
