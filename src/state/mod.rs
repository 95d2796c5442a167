//! Durable task state.
//!
//! Checkpoints live in a single SQLite database (`~/.keel/checkpoints.db` by
//! default) so that a crashed or interrupted task can resume where it left off.

mod checkpoint;
pub mod migration;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointStats, CheckpointStore};
