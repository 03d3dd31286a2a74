//! Integration tests for planwright
//!
//! These drive whole tasks through the coordinator with scripted
//! decomposers and actors, against both stores.

// Test utilities and common setup
mod common;

mod llm_tests;
mod replanning_tests;
mod store_tests;

// Re-export common utilities for use by test modules
pub use common::*;
