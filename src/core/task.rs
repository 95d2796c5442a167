//! Task lifecycle tracking.
//!
//! Long-running tasks report heartbeats, progress and checkpoints under a
//! string task id. The registry here answers the one question the core
//! needs from the outside world: which tasks are still live.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet started.
    Pending,
    /// Task is currently executing.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Whether a task in this state may still write checkpoints.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Source of truth for which tasks are still `running` or `pending`.
///
/// Checkpoint cleanup consults this before deleting anything.
pub trait ActiveTaskQuery {
    fn active_task_ids(&self) -> HashSet<String>;
}

impl ActiveTaskQuery for HashSet<String> {
    fn active_task_ids(&self) -> HashSet<String> {
        self.clone()
    }
}

/// In-memory task registry.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    statuses: HashMap<String, TaskStatus>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task as pending.
    pub fn register(&mut self, task_id: &str) {
        self.statuses
            .insert(task_id.to_string(), TaskStatus::Pending);
    }

    pub fn start(&mut self, task_id: &str) {
        self.statuses
            .insert(task_id.to_string(), TaskStatus::Running);
    }

    pub fn complete(&mut self, task_id: &str) {
        self.statuses
            .insert(task_id.to_string(), TaskStatus::Completed);
    }

    pub fn fail(&mut self, task_id: &str, error: &str) {
        self.statuses.insert(
            task_id.to_string(),
            TaskStatus::Failed {
                error: error.to_string(),
            },
        );
    }

    pub fn status(&self, task_id: &str) -> Option<&TaskStatus> {
        self.statuses.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl ActiveTaskQuery for TaskRegistry {
    fn active_task_ids(&self) -> HashSet<String> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
