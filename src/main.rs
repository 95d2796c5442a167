use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use walkdir::WalkDir;

use keel::config::Config;
use keel::orchestration::{
    DependencyGraphScheduler, PlateauConfig, ProgressPlateauMonitor, SchedulerEvent, Signal,
    StallConfig, StallDetector,
};
use keel::state::CheckpointStore;
use keel::workload::{ChunkerConfig, CodebaseInput, WorkloadChunker};
use keel::{klog, klog_warn, util, Error, PhaseNode, PhaseSet, Result};

/// Keel - resilient phase orchestration
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KEEL_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.keel/keel.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a phase file and print its execution plan
    Plan {
        /// Phase set file (.toml or .json)
        file: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,

        /// Average phase duration used for the estimate, in seconds
        #[arg(long)]
        avg_phase_secs: Option<u64>,
    },

    /// Execute a phase file, resuming from checkpoints of a previous run
    Run {
        /// Phase set file (.toml or .json)
        file: PathBuf,

        /// Checkpoint database (defaults to ~/.keel/checkpoints.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Inspect and maintain stored checkpoints
    Checkpoints {
        /// Checkpoint database (defaults to ~/.keel/checkpoints.db)
        #[arg(long, global = true)]
        db: Option<PathBuf>,

        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Split a source tree into bounded chunks
    Chunk {
        /// Root directory to scan
        root: PathBuf,

        /// Maximum lines of code per chunk
        #[arg(long)]
        max_loc: Option<usize>,

        /// Use real line counts instead of the per-directory estimate
        #[arg(long)]
        by_size: bool,

        /// Print chunks as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CheckpointAction {
    /// Show count and size totals
    Stats,
    /// List all checkpoints, newest first
    List,
    /// Show one task's checkpoint
    Show { task_id: String },
    /// Delete one task's checkpoint
    Delete { task_id: String },
    /// Delete checkpoints older than the retention window
    Cleanup {
        /// Days to keep (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,

        /// Task ids that are still active and must be kept
        #[arg(long = "active", num_args = 1..)]
        active: Vec<String>,
    },
}

/// Payload stored for each completed phase of `keel run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhaseRecord {
    phase_id: String,
    run_id: String,
    finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    Ran,
    Resumed,
}

/// Detectors wired around every running phase.
struct Supervisor {
    stalls: StallDetector,
    plateaus: Mutex<ProgressPlateauMonitor>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    keel::log::init_with_debug(cli.debug);
    let config = Config::load()?;

    match cli.command {
        Command::Plan {
            file,
            json,
            avg_phase_secs,
        } => run_plan(&file, json, avg_phase_secs, &config),
        Command::Run { file, db } => run_phases(&file, db, &config),
        Command::Checkpoints { db, action } => run_checkpoints(action, db, &config),
        Command::Chunk {
            root,
            max_loc,
            by_size,
            json,
        } => run_chunk(&root, max_loc, by_size, json, &config),
    }
}

fn open_store(db: Option<PathBuf>, config: &Config) -> Result<CheckpointStore> {
    let path = match db {
        Some(path) => path,
        None => config.checkpoint_db_path()?,
    };
    CheckpointStore::open(path)
}

fn run_plan(file: &Path, json: bool, avg_phase_secs: Option<u64>, config: &Config) -> Result<()> {
    let set = PhaseSet::load(file)?;
    let scheduler = DependencyGraphScheduler::new();

    let report = scheduler.validate(&set.phases);
    if !report.valid {
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("Invalid plan: {}", file.display());
            for issue in &report.issues {
                println!("  - {}", issue);
            }
        }
        return Err(Error::Validation(format!(
            "{} issue(s) in {}",
            report.issues.len(),
            file.display()
        )));
    }

    let avg = Duration::from_secs(avg_phase_secs.unwrap_or(config.scheduler.avg_phase_duration_secs));
    let levels = scheduler.topological_sort(&set.phases)?;
    let critical_path = scheduler.critical_path(&set.phases);
    let estimate = scheduler.estimate_duration(&set.phases, avg)?;

    if json {
        let output = serde_json::json!({
            "valid": true,
            "levels": levels,
            "critical_path": critical_path,
            "estimated_duration_secs": estimate.as_secs(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Plan: {} ({} phases)", file.display(), set.phases.len());
    println!();
    for (i, level) in levels.iter().enumerate() {
        println!("  Level {}: {}", i + 1, level.join(", "));
    }
    println!();
    println!("  Critical path: {}", critical_path.join(" -> "));
    println!(
        "  Estimate:      {} ({} levels x {}s)",
        format_duration(estimate),
        levels.len(),
        avg.as_secs()
    );
    Ok(())
}

fn run_phases(file: &Path, db: Option<PathBuf>, config: &Config) -> Result<()> {
    let set = PhaseSet::load(file)?;
    let store = open_store(db, config)?;
    let plan_key = plan_key(file)?;
    let run_id = uuid::Uuid::new_v4().to_string();

    let report = DependencyGraphScheduler::new().validate(&set.phases);
    if !report.valid {
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        return Err(Error::Validation(format!("invalid plan {}", file.display())));
    }

    println!("Running {} ({} phases)", file.display(), set.phases.len());
    klog!("run {} started: plan={} phases={}", run_id, plan_key, set.phases.len());

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<Signal>();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                print_signal(&signal);
            }
        });

        let mut stalls = StallDetector::new(StallConfig::from(&config.stall), signal_tx.clone());
        stalls.start_monitoring();
        let plateaus = ProgressPlateauMonitor::new(PlateauConfig::from(&config.plateau), signal_tx);
        let supervisor = Arc::new(Supervisor {
            stalls,
            plateaus: Mutex::new(plateaus),
        });

        // Room for every event a run can emit, so none are dropped.
        let (event_tx, mut event_rx) = mpsc::channel(set.phases.len() * 2 + 1);
        let printer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                print_event(&event);
            }
        });

        let scheduler = DependencyGraphScheduler::with_events(event_tx);
        let outcome = scheduler
            .execute(&set.phases, |phase: PhaseNode| {
                let key = checkpoint_key(&plan_key, &phase.id);
                run_phase(
                    phase,
                    key,
                    run_id.clone(),
                    store.clone(),
                    Arc::clone(&supervisor),
                )
            })
            .await;

        drop(scheduler);
        let _ = printer.await;
        outcome
    });

    match result {
        Ok(results) => {
            for phase in &set.phases {
                store.delete(&checkpoint_key(&plan_key, &phase.id))?;
            }
            let resumed = results
                .values()
                .filter(|o| **o == PhaseOutcome::Resumed)
                .count();
            println!();
            println!(
                "Completed {} phases ({} resumed from checkpoints)",
                results.len(),
                resumed
            );
            klog!("run {} completed", run_id);
            Ok(())
        }
        Err(e) => {
            println!();
            println!("Run failed: {}", e);
            println!("Completed phases are checkpointed; re-run to resume.");
            klog_warn!("run {} failed: {}", run_id, e);
            Err(e)
        }
    }
}

/// Checkpoint namespace of a plan: its canonical path, so same-named plans
/// in different directories never resume each other's phases.
fn plan_key(file: &Path) -> Result<String> {
    Ok(std::fs::canonicalize(file)?.to_string_lossy().into_owned())
}

fn checkpoint_key(plan_key: &str, phase_id: &str) -> String {
    format!("{}/{}", plan_key, phase_id)
}

async fn run_phase(
    phase: PhaseNode,
    key: String,
    run_id: String,
    store: CheckpointStore,
    supervisor: Arc<Supervisor>,
) -> Result<PhaseOutcome> {
    let existing = {
        let store = store.clone();
        let key = key.clone();
        util::blocking(move || store.load(&key)).await?
    };
    if existing.is_some() {
        println!("  - {} (resumed from checkpoint)", phase.id);
        return Ok(PhaseOutcome::Resumed);
    }

    supervisor.stalls.record_heartbeat(&phase.id).await;
    let result = match phase.command() {
        Some(command) => run_command(&phase.id, command, &supervisor).await,
        None => Ok(()),
    };
    supervisor.stalls.remove_task(&phase.id).await;
    supervisor.plateaus.lock().await.task_completed(&phase.id);
    result?;

    let record = PhaseRecord {
        phase_id: phase.id.clone(),
        run_id: run_id.clone(),
        finished_at: Utc::now(),
    };
    util::blocking(move || store.save(&key, &run_id, &record)).await?;
    Ok(PhaseOutcome::Ran)
}

/// Run a phase command. Each stdout line counts as a heartbeat; lines of
/// the form `keel:progress <fraction>` also report progress.
async fn run_command(phase_id: &str, command: &str, supervisor: &Supervisor) -> Result<()> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            supervisor.stalls.record_heartbeat(phase_id).await;
            if let Some(progress) = parse_progress(&line) {
                // Out-of-range values are logged and dropped by the monitor.
                let _ = supervisor
                    .plateaus
                    .lock()
                    .await
                    .record_progress(phase_id, progress);
            }
            println!("    [{}] {}", phase_id, line);
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Command(format!("`{}` exited with {}", command, status)))
    }
}

fn parse_progress(line: &str) -> Option<f64> {
    line.trim()
        .strip_prefix("keel:progress")
        .and_then(|rest| rest.trim().parse().ok())
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::LevelStarted { index, phases } => {
            println!("Level {}: {}", index + 1, phases.join(", "));
        }
        SchedulerEvent::PhaseCompleted { phase_id } => println!("  ✓ {}", phase_id),
        SchedulerEvent::PhaseFailed { phase_id, error } => {
            println!("  ✗ {}: {}", phase_id, error)
        }
        SchedulerEvent::AllPhasesComplete => {}
    }
}

fn print_signal(signal: &Signal) {
    match signal {
        Signal::Stalled(report) => eprintln!(
            "warning: {} stalled (no output for {} sweeps since {})",
            report.task_id,
            report.missed_count,
            report.last_heartbeat.format("%H:%M:%S")
        ),
        Signal::Plateaued(report) => eprintln!(
            "warning: {} progress plateaued (slope {:.4}); suggestions: {}",
            report.task_id,
            report.slope,
            report
                .suggestions
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn run_checkpoints(action: CheckpointAction, db: Option<PathBuf>, config: &Config) -> Result<()> {
    let store = open_store(db, config)?;

    match action {
        CheckpointAction::Stats => {
            let stats = store.stats()?;
            println!("  Checkpoints: {}", stats.total);
            println!("  Total size:  {} bytes", stats.total_size_bytes);
            println!("  Avg size:    {:.1} bytes", stats.avg_size_bytes);
        }
        CheckpointAction::List => {
            let checkpoints = store.list()?;
            if checkpoints.is_empty() {
                println!("No checkpoints.");
            }
            for cp in checkpoints {
                println!(
                    "  {}  {:<32} {:>8} bytes  {}",
                    cp.id.short(),
                    cp.task_id,
                    cp.size_bytes,
                    cp.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        CheckpointAction::Show { task_id } => match store.load(&task_id)? {
            Some(cp) => {
                let data: serde_json::Value = cp.decode()?;
                let output = serde_json::json!({
                    "id": cp.id.to_string(),
                    "task_id": cp.task_id,
                    "token": cp.token,
                    "size_bytes": cp.size_bytes,
                    "created_at": cp.created_at.to_rfc3339(),
                    "data": data,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            None => println!("No checkpoint for {}", task_id),
        },
        CheckpointAction::Delete { task_id } => {
            if store.delete(&task_id)? {
                println!("Deleted checkpoint for {}", task_id);
            } else {
                println!("No checkpoint for {}", task_id);
            }
        }
        CheckpointAction::Cleanup { days, active } => {
            let days = days.unwrap_or(config.checkpoint.days_to_keep);
            let active: HashSet<String> = active.into_iter().collect();
            let deleted = store.cleanup(days, &active)?;
            println!("Deleted {} checkpoint(s) older than {} days", deleted, days);
        }
    }
    Ok(())
}

fn run_chunk(
    root: &Path,
    max_loc: Option<usize>,
    by_size: bool,
    json: bool,
    config: &Config,
) -> Result<()> {
    let chunker = WorkloadChunker::new(ChunkerConfig::from(&config.chunker));
    let max_loc = max_loc.unwrap_or(chunker.config().max_chunk_loc);
    let files = collect_files(root);

    let chunks = if by_size {
        let sized: Vec<(PathBuf, usize)> = files
            .into_iter()
            .map(|file| {
                let loc = count_lines(&root.join(&file));
                (file, loc)
            })
            .collect();
        chunker.chunk_by_actual_size(&sized, max_loc)
    } else {
        chunker.chunk_large_codebase(&CodebaseInput::new(files), max_loc)
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    println!("{}: {} chunk(s), max {} LOC", root.display(), chunks.len(), max_loc);
    for chunk in &chunks {
        println!();
        println!(
            "  Chunk {}/{} (~{} LOC, {} files)",
            chunk.chunk_index + 1,
            chunk.total_chunks,
            chunk.estimated_size,
            chunk.items.len()
        );
        for file in &chunk.items {
            println!("    {}", file.display());
        }
    }
    Ok(())
}

/// Regular files under `root`, relative to it, skipping hidden entries and
/// build output.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || (!name.starts_with('.') && name != "target" && name != "node_modules")
        })
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            let path = entry.path();
            files.push(path.strip_prefix(root).unwrap_or(path).to_path_buf());
        }
    }
    files
}

fn count_lines(path: &Path) -> usize {
    match std::fs::read(path) {
        Ok(bytes) => {
            let newlines = bytes.iter().filter(|b| **b == b'\n').count();
            if bytes.last().is_some_and(|b| *b != b'\n') {
                newlines + 1
            } else {
                newlines
            }
        }
        Err(e) => {
            klog_warn!("could not read {}: {}", path.display(), e);
            0
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
