//! Heartbeat-based stall detection.
//!
//! Every running task is expected to call [`StallDetector::record_heartbeat`]
//! roughly once per `interval`. Two independent checks exist:
//!
//! - [`StallDetector::is_stalled`] is a point-in-time query: has the task
//!   been silent for longer than `timeout`?
//! - The periodic sweep counts consecutive sweeps in which a task was
//!   silent for longer than `interval`. Once the count reaches `max_missed`
//!   a [`Signal::Stalled`] is emitted.
//!
//! ## Firing policy
//!
//! Signals are edge-triggered: a silent task is reported once. `missed_count`
//! keeps growing on later sweeps, but no further signal is emitted until a
//! heartbeat resets the record and the task goes silent again.

use crate::actors::ActorHandle;
use crate::config::StallSection;
use crate::orchestration::signal::{Signal, SignalSink, StallReport};
use crate::{klog_debug, klog_trace, klog_warn};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Default expected heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence after which [`StallDetector::is_stalled`] reports true.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(90);

/// Default number of consecutive missed sweeps before a stall is signalled.
pub const DEFAULT_MAX_MISSED: u32 = 3;

/// Configuration for stall detection.
#[derive(Debug, Clone)]
pub struct StallConfig {
    /// Expected heartbeat period; also the sweep period.
    pub interval: Duration,
    /// Silence considered stalled by point-in-time queries.
    pub timeout: Duration,
    /// Consecutive missed sweeps before a stall is signalled.
    pub max_missed: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_STALL_TIMEOUT,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

impl StallConfig {
    pub fn new(interval: Duration, timeout: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            timeout,
            max_missed,
        }
    }
}

impl From<&StallSection> for StallConfig {
    fn from(section: &StallSection) -> Self {
        Self {
            interval: Duration::from_millis(section.interval_ms),
            timeout: Duration::from_millis(section.timeout_ms),
            max_missed: section.max_missed,
        }
    }
}

/// Heartbeat state for one task.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub task_id: String,
    /// Wall-clock time of the last heartbeat, for reporting.
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive sweeps without a heartbeat. Reset to 0 by a heartbeat.
    pub missed_count: u32,
    /// Monotonic time of the last heartbeat, for measuring silence.
    last_seen: Instant,
    /// Whether the current silent stretch has already been reported.
    signalled: bool,
}

impl HeartbeatRecord {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            last_heartbeat: Utc::now(),
            missed_count: 0,
            last_seen: Instant::now(),
            signalled: false,
        }
    }

    /// Time since the last heartbeat.
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

type Records = Arc<RwLock<HashMap<String, HeartbeatRecord>>>;

/// Per-task heartbeat tracker with an optional background sweep.
pub struct StallDetector {
    config: StallConfig,
    records: Records,
    sink: Arc<dyn SignalSink>,
    monitor: Option<ActorHandle>,
}

impl StallDetector {
    /// Create a detector that reports stalls to `sink`.
    pub fn new<S: SignalSink + 'static>(config: StallConfig, sink: S) -> Self {
        Self {
            config,
            records: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(sink),
            monitor: None,
        }
    }

    pub fn config(&self) -> &StallConfig {
        &self.config
    }

    /// Record a heartbeat, starting to track the task if needed.
    pub async fn record_heartbeat(&self, task_id: &str) {
        let mut records = self.records.write().await;
        let record = records
            .entry(task_id.to_string())
            .or_insert_with(|| HeartbeatRecord::new(task_id));
        record.last_heartbeat = Utc::now();
        record.last_seen = Instant::now();
        record.missed_count = 0;
        record.signalled = false;
        klog_trace!("Heartbeat from {}", task_id);
    }

    /// Whether the task has been silent for longer than `timeout`.
    ///
    /// Untracked tasks are never stalled.
    pub async fn is_stalled(&self, task_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(task_id)
            .map(|record| record.silence() > self.config.timeout)
            .unwrap_or(false)
    }

    /// Snapshot of a task's heartbeat record.
    pub async fn record(&self, task_id: &str) -> Option<HeartbeatRecord> {
        self.records.read().await.get(task_id).cloned()
    }

    pub async fn tracked_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Run one sweep now and return the stalls it signalled.
    pub async fn sweep(&self) -> Vec<StallReport> {
        sweep_records(&self.records, &self.config, self.sink.as_ref()).await
    }

    /// Start sweeping every `interval` in a background task.
    ///
    /// Calling this while already monitoring does nothing. Must be called
    /// from within a Tokio runtime.
    pub fn start_monitoring(&mut self) {
        if self.is_monitoring() {
            return;
        }

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let records = Arc::clone(&self.records);
        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();
        let period = config.interval.max(Duration::from_millis(1));

        klog_debug!(
            "StallDetector::start_monitoring interval={:?} max_missed={}",
            period,
            config.max_missed
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        klog_debug!("StallDetector sweep cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        sweep_records(&records, &config, sink.as_ref()).await;
                    }
                }
            }
        });

        self.monitor = Some(ActorHandle::new(cancel));
    }

    /// Stop the background sweep, if running.
    pub fn stop_monitoring(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.shutdown();
            klog_debug!("StallDetector::stop_monitoring");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .as_ref()
            .map(|handle| !handle.is_cancelled())
            .unwrap_or(false)
    }

    /// Stop tracking a task.
    pub async fn remove_task(&self, task_id: &str) {
        self.records.write().await.remove(task_id);
    }

    /// Stop monitoring and forget every task.
    pub async fn clear(&mut self) {
        self.stop_monitoring();
        self.records.write().await.clear();
    }
}

async fn sweep_records(
    records: &Records,
    config: &StallConfig,
    sink: &dyn SignalSink,
) -> Vec<StallReport> {
    let mut reports = Vec::new();
    {
        let mut records = records.write().await;
        let now = Utc::now();
        for record in records.values_mut() {
            if record.silence() <= config.interval {
                continue;
            }
            record.missed_count = record.missed_count.saturating_add(1);
            klog_trace!(
                "Task {} missed heartbeat ({} consecutive)",
                record.task_id,
                record.missed_count
            );

            if record.missed_count >= config.max_missed && !record.signalled {
                record.signalled = true;
                klog_warn!(
                    "Task {} stalled: {} missed heartbeats, last at {}",
                    record.task_id,
                    record.missed_count,
                    record.last_heartbeat
                );
                reports.push(StallReport {
                    task_id: record.task_id.clone(),
                    last_heartbeat: record.last_heartbeat,
                    missed_count: record.missed_count,
                    stalled_at: now,
                });
            }
        }
    }

    for report in &reports {
        sink.emit(Signal::Stalled(report.clone()));
    }
    reports
}
