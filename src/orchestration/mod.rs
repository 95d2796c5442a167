//! Orchestration layer for keel.
//!
//! This module provides the dependency-ordered phase scheduler and the
//! detectors a supervisor wires around each running task: heartbeat stall
//! detection and progress plateau detection. Detectors report through
//! typed signals on an injected sink.

mod plateau;
mod scheduler;
mod signal;
mod stall;

pub use plateau::{calculate_slope, PlateauConfig, ProgressPlateauMonitor, ProgressStats};
pub use scheduler::{DependencyGraphScheduler, SchedulerEvent};
pub use signal::{PlateauReport, Signal, SignalSink, StallReport, StrategySuggestion};
pub use stall::{
    HeartbeatRecord, StallConfig, StallDetector, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_MISSED,
    DEFAULT_STALL_TIMEOUT,
};
