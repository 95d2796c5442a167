pub mod actors;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;
pub mod workload;

pub use error::{Error, Result};

pub use crate::core::{
    ActiveTaskQuery, PhaseGraph, PhaseNode, PhaseSet, TaskRegistry, TaskStatus, ValidationIssue,
    ValidationReport,
};
pub use orchestration::{
    DependencyGraphScheduler, ProgressPlateauMonitor, SchedulerEvent, Signal, SignalSink,
    StallDetector,
};
pub use state::{Checkpoint, CheckpointStore};
pub use workload::{Chunk, WorkloadChunker};
