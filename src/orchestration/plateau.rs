//! Progress plateau detection.
//!
//! Tasks report fractional progress in `[0, 1]`. The monitor keeps the last
//! `history_size` samples per task and fits an ordinary-least-squares line
//! through them; a slope below `plateau_threshold` per sample means the
//! task has stopped meaningfully advancing and a [`Signal::Plateaued`] is
//! emitted for an external strategy controller.
//!
//! Like stall detection, plateau signals are edge-triggered: one signal per
//! entry into a plateau. A later check that finds progress moving again
//! re-arms the signal for that task.

use crate::config::PlateauSection;
use crate::error::{Error, Result};
use crate::orchestration::signal::{PlateauReport, Signal, SignalSink, StrategySuggestion};
use crate::{klog_debug, klog_trace, klog_warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// A slope needs two points; fewer samples never count as a plateau.
const MIN_SLOPE_SAMPLES: usize = 2;

/// Configuration for plateau detection.
#[derive(Debug, Clone)]
pub struct PlateauConfig {
    /// Samples kept per task; older samples are evicted.
    pub history_size: usize,
    /// Minimum slope (progress per sample) that still counts as advancing.
    pub plateau_threshold: f64,
    /// Samples required before a plateau can be declared. Values below 2
    /// are treated as 2.
    pub min_samples: usize,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            history_size: 10,
            plateau_threshold: 0.005,
            min_samples: 5,
        }
    }
}

impl From<&PlateauSection> for PlateauConfig {
    fn from(section: &PlateauSection) -> Self {
        Self {
            history_size: section.history_size.max(1),
            plateau_threshold: section.plateau_threshold,
            min_samples: section.min_samples.max(MIN_SLOPE_SAMPLES),
        }
    }
}

/// Per-task snapshot returned by [`ProgressPlateauMonitor::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub history_length: usize,
    pub current_progress: Option<f64>,
    pub slope: f64,
    pub is_plateau: bool,
}

/// OLS slope of `values` against their index `0..n`.
///
/// Returns 0 when the slope is undefined (fewer than two samples).
pub fn calculate_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Tracks per-task progress history and signals plateaus.
///
/// Methods take `&mut self`; share between tasks with `Arc<RwLock<_>>`.
pub struct ProgressPlateauMonitor {
    config: PlateauConfig,
    history: HashMap<String, VecDeque<f64>>,
    /// Tasks whose current plateau has already been signalled.
    plateaued: HashSet<String>,
    sink: Arc<dyn SignalSink>,
}

impl ProgressPlateauMonitor {
    pub fn new<S: SignalSink + 'static>(config: PlateauConfig, sink: S) -> Self {
        Self {
            config,
            history: HashMap::new(),
            plateaued: HashSet::new(),
            sink: Arc::new(sink),
        }
    }

    pub fn config(&self) -> &PlateauConfig {
        &self.config
    }

    fn min_samples(&self) -> usize {
        self.config.min_samples.max(MIN_SLOPE_SAMPLES)
    }

    /// Append a progress sample and check for a plateau.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgress`] for values outside `[0, 1]`
    /// (including NaN). The sample is discarded and history is unchanged.
    pub fn record_progress(&mut self, task_id: &str, progress: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&progress) {
            klog_warn!(
                "Rejected progress {} for task {}: outside [0, 1]",
                progress,
                task_id
            );
            return Err(Error::InvalidProgress {
                task_id: task_id.to_string(),
                value: progress,
            });
        }

        let capacity = self.config.history_size.max(1);
        let samples = self
            .history
            .entry(task_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        samples.push_back(progress);
        while samples.len() > capacity {
            samples.pop_front();
        }
        klog_trace!("Progress {} for {} ({} samples)", progress, task_id, samples.len());

        if samples.len() < self.min_samples() {
            return Ok(());
        }

        if self.detect_plateau(task_id) {
            if self.plateaued.insert(task_id.to_string()) {
                self.adjust_strategy(task_id);
            }
        } else if self.plateaued.remove(task_id) {
            klog_debug!("Task {} progressing again", task_id);
        }
        Ok(())
    }

    /// Whether the task's progress slope is below the threshold.
    ///
    /// Requires at least `min_samples` samples; fewer is never a plateau.
    pub fn detect_plateau(&self, task_id: &str) -> bool {
        match self.history.get(task_id) {
            Some(samples) if samples.len() >= self.min_samples() => {
                let values: Vec<f64> = samples.iter().copied().collect();
                calculate_slope(&values) < self.config.plateau_threshold
            }
            _ => false,
        }
    }

    /// Emit a plateau signal with the task's full history and the fixed
    /// suggestion list.
    pub fn adjust_strategy(&self, task_id: &str) {
        let history: Vec<f64> = self
            .history
            .get(task_id)
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default();
        let slope = calculate_slope(&history);
        klog_warn!(
            "Task {} plateaued at {:?} (slope {:.5})",
            task_id,
            history.last(),
            slope
        );
        self.sink.emit(Signal::Plateaued(PlateauReport {
            task_id: task_id.to_string(),
            history,
            slope,
            suggestions: StrategySuggestion::ALL.to_vec(),
        }));
    }

    /// Forget a finished task.
    pub fn task_completed(&mut self, task_id: &str) {
        self.history.remove(task_id);
        self.plateaued.remove(task_id);
    }

    /// Progress history for a task, oldest first.
    pub fn history(&self, task_id: &str) -> Option<Vec<f64>> {
        self.history
            .get(task_id)
            .map(|samples| samples.iter().copied().collect())
    }

    pub fn stats(&self) -> HashMap<String, ProgressStats> {
        self.history
            .iter()
            .map(|(task_id, samples)| {
                let values: Vec<f64> = samples.iter().copied().collect();
                let stats = ProgressStats {
                    history_length: values.len(),
                    current_progress: values.last().copied(),
                    slope: calculate_slope(&values),
                    is_plateau: self.detect_plateau(task_id),
                };
                (task_id.clone(), stats)
            })
            .collect()
    }
}
