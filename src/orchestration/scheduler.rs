//! Level-by-level phase execution.
//!
//! The scheduler orders phases into execution levels and drives them
//! through an injected executor: levels run strictly one after another,
//! phases inside a level run concurrently and are all joined before the
//! next level starts.
//!
//! ## Failure policy
//!
//! Execution is fail-fast. The first phase error aborts the sibling phases
//! still running in that level, no later level starts, and `execute`
//! returns [`Error::PhaseFailed`]. Results of siblings that already
//! finished are discarded along with the plan.

use crate::core::dag::PhaseGraph;
use crate::core::phase::{PhaseNode, ValidationReport};
use crate::error::{Error, Result};
use crate::{klog, klog_debug, klog_error, klog_trace, klog_warn};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Events emitted by the scheduler as a plan executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A level's phases have been dispatched.
    LevelStarted {
        /// Zero-based level index.
        index: usize,
        /// Phases dispatched in this level.
        phases: Vec<String>,
    },
    /// A phase's executor returned successfully.
    PhaseCompleted {
        phase_id: String,
    },
    /// A phase's executor returned an error; the run stops.
    PhaseFailed {
        phase_id: String,
        error: String,
    },
    /// Every level finished successfully.
    AllPhasesComplete,
}

/// Dependency-ordered executor for phase sets.
///
/// # Example
///
/// ```ignore
/// use keel::core::PhaseNode;
/// use keel::orchestration::DependencyGraphScheduler;
///
/// let phases = vec![PhaseNode::new("a", &[]), PhaseNode::new("b", &["a"])];
/// let scheduler = DependencyGraphScheduler::new();
/// let results = scheduler
///     .execute(&phases, |phase| async move { Ok::<_, String>(phase.id.len()) })
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyGraphScheduler {
    /// Channel for emitting scheduler events.
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl DependencyGraphScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler that reports progress on `event_tx`.
    ///
    /// Events are sent without waiting, so execution never blocks on a slow
    /// or absent reader. When the channel is full the event is dropped and
    /// logged; size the channel for the plan or drain it concurrently.
    pub fn with_events(event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        Self {
            event_tx: Some(event_tx),
        }
    }

    pub fn build_graph(&self, phases: &[PhaseNode]) -> PhaseGraph {
        PhaseGraph::build(phases)
    }

    pub fn topological_sort(&self, phases: &[PhaseNode]) -> Result<Vec<Vec<String>>> {
        PhaseGraph::build(phases).topological_sort()
    }

    pub fn validate(&self, phases: &[PhaseNode]) -> ValidationReport {
        PhaseGraph::validate(phases)
    }

    pub fn critical_path(&self, phases: &[PhaseNode]) -> Vec<String> {
        PhaseGraph::build(phases).critical_path()
    }

    pub fn estimate_duration(
        &self,
        phases: &[PhaseNode],
        avg_phase_duration: Duration,
    ) -> Result<Duration> {
        PhaseGraph::build(phases).estimate_duration(avg_phase_duration)
    }

    /// Run every phase through `executor`, respecting dependencies.
    ///
    /// Returns each phase's result keyed by phase id. The scheduler never
    /// inspects results; executor errors are reported through their
    /// `Display` text.
    ///
    /// # Errors
    /// - [`Error::Cycle`] if the plan cannot be ordered; nothing runs.
    /// - [`Error::PhaseFailed`] for the first failing phase.
    /// - [`Error::TaskJoin`] if an executor panics.
    pub async fn execute<F, Fut, T, E>(
        &self,
        phases: &[PhaseNode],
        executor: F,
    ) -> Result<HashMap<String, T>>
    where
        F: Fn(PhaseNode) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let graph = PhaseGraph::build(phases);
        let levels = graph.topological_sort()?;
        klog!(
            "Executing {} phases in {} levels",
            graph.phase_count(),
            levels.len()
        );

        let mut results = HashMap::with_capacity(graph.phase_count());

        for (index, level) in levels.into_iter().enumerate() {
            klog_debug!("Level {} starting: {:?}", index, level);
            self.emit(SchedulerEvent::LevelStarted {
                index,
                phases: level.clone(),
            });

            let mut running = JoinSet::new();
            for phase_id in level {
                let Some(phase) = graph.get_phase(&phase_id) else {
                    continue;
                };
                let work = executor(phase.clone());
                running.spawn(async move { (phase_id, work.await) });
            }

            // Dropping `running` on an early return aborts the remaining siblings.
            while let Some(joined) = running.join_next().await {
                let (phase_id, outcome) = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;
                match outcome {
                    Ok(value) => {
                        klog_debug!("Phase {} completed", phase_id);
                        self.emit(SchedulerEvent::PhaseCompleted {
                            phase_id: phase_id.clone(),
                        });
                        results.insert(phase_id, value);
                    }
                    Err(e) => {
                        let error = e.to_string();
                        klog_error!("Phase {} failed: {}", phase_id, error);
                        running.abort_all();
                        self.emit(SchedulerEvent::PhaseFailed {
                            phase_id: phase_id.clone(),
                            error: error.clone(),
                        });
                        return Err(Error::PhaseFailed { phase_id, error });
                    }
                }
            }
        }

        self.emit(SchedulerEvent::AllPhasesComplete);
        klog!("All {} phases complete", results.len());
        Ok(results)
    }

    fn emit(&self, event: SchedulerEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                klog_warn!("Event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                klog_trace!("Event receiver gone");
            }
        }
    }
}
