// Library exports for planwright
// The binary and the integration tests build on these modules

pub mod actors;
pub mod approval;
pub mod classifier;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod llm;
pub mod persistence;
pub mod planning;
pub mod replanning;

pub use error::{EngineError, EngineResult};
pub use replanning::{Coordinator, InterventionAction, TaskReport};
