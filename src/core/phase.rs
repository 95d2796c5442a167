//! Phase data model for the execution plan.
//!
//! Phases are the atomic pipeline units. Each phase names the phases it
//! depends on and carries an opaque configuration blob that only the
//! injected executor interprets.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single phase in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseNode {
    /// Unique identifier within a phase set.
    #[serde(alias = "phaseId", alias = "phase_id")]
    pub id: String,
    /// Ids of phases that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Executor-specific configuration; never inspected by the scheduler.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PhaseNode {
    /// Create a phase with no configuration.
    pub fn new(id: &str, dependencies: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            config: serde_json::Value::Null,
        }
    }

    /// Attach executor configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Shell command from `config.command`, if present.
    pub fn command(&self) -> Option<&str> {
        self.config.get("command").and_then(|c| c.as_str())
    }
}

/// A phase set as stored on disk.
///
/// TOML files use `[[phase]]` tables; JSON files use a `"phase"` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSet {
    #[serde(rename = "phase", default)]
    pub phases: Vec<PhaseNode>,
}

impl PhaseSet {
    /// Load a phase set, choosing the format from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(toml::from_str(&contents)?)
        }
    }
}

/// A single problem found by plan validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationIssue {
    /// A dependency references a phase that does not exist.
    MissingDependency { phase: String, dependency: String },
    /// A phase lists itself as a dependency.
    SelfDependency { phase: String },
    /// The listed phases never became schedulable.
    Cycle { phases: Vec<String> },
    /// The same id is declared more than once.
    DuplicatePhase { phase: String },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::MissingDependency { phase, dependency } => {
                write!(f, "phase '{}' depends on unknown phase '{}'", phase, dependency)
            }
            ValidationIssue::SelfDependency { phase } => {
                write!(f, "phase '{}' depends on itself", phase)
            }
            ValidationIssue::Cycle { phases } => {
                write!(f, "dependency cycle among: {}", phases.join(", "))
            }
            ValidationIssue::DuplicatePhase { phase } => {
                write!(f, "phase '{}' is declared more than once", phase)
            }
        }
    }
}

/// Outcome of validating a phase set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            valid: issues.is_empty(),
            issues,
        }
    }
}
