//! Core domain models for keel.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration engine: phases, the phase dependency graph, and task
//! lifecycle tracking.

pub mod dag;
pub mod phase;
pub mod task;

pub use dag::PhaseGraph;
pub use phase::{PhaseNode, PhaseSet, ValidationIssue, ValidationReport};
pub use task::{ActiveTaskQuery, TaskRegistry, TaskStatus};
