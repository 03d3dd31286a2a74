//! Task planning
//!
//! The task/plan/step model, structural checks over the step graph, and
//! plan generation from decomposer output.

pub mod graph;
pub mod planner;
pub mod types;

pub use planner::{plan_from, Planner};
pub use types::{
    ActorKind, ActorRef, AlternativeMeta, Condition, FailureRecord, Plan, PlanEvent, PlanStatus,
    Role, Step, StepKind, StepStatus, Strategy, StrategyVariant, Task, TaskStatus,
};
