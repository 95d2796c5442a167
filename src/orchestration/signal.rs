//! Typed supervisor signals.
//!
//! Detectors never act on their findings. They place a [`Signal`] on an
//! injected [`SignalSink`] and a supervisor decides what recovery to take
//! (reassign, change strategy, alert a human).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::klog_warn;

/// Adjustments a strategy controller may apply to a plateaued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySuggestion {
    ReduceBatchSize,
    TryAlternateTool,
    UseStricterPrompts,
}

impl StrategySuggestion {
    /// The fixed suggestion list attached to every plateau signal.
    pub const ALL: [StrategySuggestion; 3] = [
        StrategySuggestion::ReduceBatchSize,
        StrategySuggestion::TryAlternateTool,
        StrategySuggestion::UseStricterPrompts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategySuggestion::ReduceBatchSize => "reduce_batch_size",
            StrategySuggestion::TryAlternateTool => "try_alternate_tool",
            StrategySuggestion::UseStricterPrompts => "use_stricter_prompts",
        }
    }
}

impl std::fmt::Display for StrategySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task stopped sending heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallReport {
    pub task_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_count: u32,
    pub stalled_at: DateTime<Utc>,
}

/// A task's progress stopped meaningfully advancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauReport {
    pub task_id: String,
    /// Full progress history, oldest first.
    pub history: Vec<f64>,
    pub slope: f64,
    pub suggestions: Vec<StrategySuggestion>,
}

/// Signals emitted by the detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Signal {
    Stalled(StallReport),
    Plateaued(PlateauReport),
}

impl Signal {
    pub fn task_id(&self) -> &str {
        match self {
            Signal::Stalled(report) => &report.task_id,
            Signal::Plateaued(report) => &report.task_id,
        }
    }
}

/// Destination for detector signals.
///
/// Emitting never fails from the detector's point of view; a closed
/// channel is logged and the signal dropped.
pub trait SignalSink: Send + Sync {
    fn emit(&self, signal: Signal);
}

impl SignalSink for mpsc::UnboundedSender<Signal> {
    fn emit(&self, signal: Signal) {
        if let Err(e) = self.send(signal) {
            klog_warn!(
                "Signal for task {} dropped: receiver closed",
                e.0.task_id()
            );
        }
    }
}

impl SignalSink for crossbeam_channel::Sender<Signal> {
    fn emit(&self, signal: Signal) {
        if let Err(e) = self.send(signal) {
            klog_warn!(
                "Signal for task {} dropped: receiver closed",
                e.0.task_id()
            );
        }
    }
}
