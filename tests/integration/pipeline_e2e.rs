//! End-to-end planning and execution of phase sets.

use std::collections::HashMap;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use keel::{DependencyGraphScheduler, Error, PhaseSet, SchedulerEvent, ValidationIssue};

use crate::fixtures::{build_pipeline, diamond, generated_dag, write_phase_file, Recorder};

/// Test: Diamond plan
/// Given phases a, b -> a, c -> a, d -> [b, c]
/// When the plan is computed
/// Then levels are [[a], [b, c], [d]] and the critical path has length 3
#[test]
fn test_diamond_plan() {
    let scheduler = DependencyGraphScheduler::new();
    let phases = diamond();

    let levels = scheduler.topological_sort(&phases).unwrap();
    assert_eq!(
        levels,
        vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]
    );

    let path = scheduler.critical_path(&phases);
    assert_eq!(path.len(), 3);
    assert_eq!(path.first().map(String::as_str), Some("a"));
    assert_eq!(path.last().map(String::as_str), Some("d"));
    assert!(path[1] == "b" || path[1] == "c");

    let estimate = scheduler
        .estimate_duration(&phases, Duration::from_secs(60))
        .unwrap();
    assert_eq!(estimate, Duration::from_secs(180));
}

/// Test: Level ordering property
/// Given a generated acyclic plan
/// When it is sorted
/// Then every phase appears once, at a level above all its dependencies
#[test]
fn test_levels_respect_dependencies() {
    let phases = generated_dag(60);
    let levels = DependencyGraphScheduler::new()
        .topological_sort(&phases)
        .unwrap();

    let mut level_of = HashMap::new();
    for (i, level) in levels.iter().enumerate() {
        for id in level {
            assert!(level_of.insert(id.clone(), i).is_none(), "{} listed twice", id);
        }
    }
    assert_eq!(level_of.len(), phases.len());

    for phase in &phases {
        for dep in &phase.dependencies {
            assert!(level_of[&phase.id] > level_of[dep]);
        }
    }
}

/// Test: Execution respects dependencies
/// Given a realistic build pipeline
/// When every phase is executed with a short delay
/// Then no phase starts before its dependencies finish and all results return
#[tokio::test]
async fn test_execute_build_pipeline() {
    let phases = build_pipeline();
    let recorder = Recorder::new();

    let results = DependencyGraphScheduler::new()
        .execute(&phases, |phase| {
            let recorder = recorder.clone();
            async move {
                recorder.start(&phase.id);
                tokio::time::sleep(Duration::from_millis(5)).await;
                recorder.finish(&phase.id);
                Ok::<_, String>(format!("{} done", phase.id))
            }
        })
        .await
        .unwrap();

    assert_eq!(results.len(), phases.len());
    assert_eq!(results["release"], "release done");
    recorder.assert_dependency_order(&phases);
}

/// Test: Plan loaded from TOML
/// Given a phase file with commands in its config tables
/// When it is loaded and executed
/// Then the executor sees each phase's opaque config
#[tokio::test]
async fn test_execute_phase_file() {
    let dir = TempDir::new().unwrap();
    let path = write_phase_file(
        &dir,
        "pipeline.toml",
        r#"
[[phase]]
id = "fetch"

[phase.config]
command = "echo fetch"

[[phase]]
id = "build"
dependencies = ["fetch"]

[phase.config]
command = "echo build"

[[phase]]
id = "report"
dependencies = ["build"]
"#,
    );

    let set = PhaseSet::load(&path).unwrap();
    assert!(DependencyGraphScheduler::new().validate(&set.phases).valid);

    let results = DependencyGraphScheduler::new()
        .execute(&set.phases, |phase| async move {
            Ok::<_, String>(phase.command().map(str::to_string))
        })
        .await
        .unwrap();

    assert_eq!(results["fetch"].as_deref(), Some("echo fetch"));
    assert_eq!(results["build"].as_deref(), Some("echo build"));
    assert_eq!(results["report"], None);
}

/// Test: Cycles fail closed
/// Given a phase file whose phases form a cycle
/// When it is validated and executed
/// Then validation reports the cycle and no phase runs
#[tokio::test]
async fn test_cycle_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = write_phase_file(
        &dir,
        "cycle.json",
        r#"{"phase": [
            {"id": "root"},
            {"id": "x", "dependencies": ["root", "z"]},
            {"id": "y", "dependencies": ["x"]},
            {"id": "z", "dependencies": ["y"]}
        ]}"#,
    );
    let set = PhaseSet::load(&path).unwrap();
    let scheduler = DependencyGraphScheduler::new();

    let report = scheduler.validate(&set.phases);
    assert!(!report.valid);
    assert!(report
        .issues
        .iter()
        .any(|issue| matches!(issue, ValidationIssue::Cycle { .. })));

    let recorder = Recorder::new();
    let err = scheduler
        .execute(&set.phases, |phase| {
            let recorder = recorder.clone();
            async move {
                recorder.start(&phase.id);
                Ok::<_, String>(())
            }
        })
        .await
        .unwrap_err();

    match err {
        Error::Cycle { mut phases } => {
            phases.sort();
            assert_eq!(phases, vec!["x", "y", "z"]);
        }
        other => panic!("expected cycle error, got {:?}", other),
    }
    assert!(recorder.started().is_empty());
}

/// Test: Every validation issue is reported
/// Given a plan with a missing dependency and a self-dependency
/// When it is validated
/// Then both problems are listed
#[test]
fn test_validate_reports_all_issues() {
    let mut phases = diamond();
    phases.push(keel::PhaseNode::new("lint", &["lint"]));
    phases.push(keel::PhaseNode::new("deploy", &["approve"]));

    let report = DependencyGraphScheduler::new().validate(&phases);
    assert!(!report.valid);
    assert!(report.issues.contains(&ValidationIssue::MissingDependency {
        phase: "deploy".to_string(),
        dependency: "approve".to_string(),
    }));
    assert!(report.issues.contains(&ValidationIssue::SelfDependency {
        phase: "lint".to_string(),
    }));
}

/// Test: Fail-fast
/// Given a pipeline where `backend` fails
/// When it is executed
/// Then execute fails with that phase and no later level starts
#[tokio::test]
async fn test_failure_stops_later_levels() {
    let phases = build_pipeline();
    let recorder = Recorder::new();

    let err = DependencyGraphScheduler::new()
        .execute(&phases, |phase| {
            let recorder = recorder.clone();
            async move {
                recorder.start(&phase.id);
                if phase.id == "backend" {
                    return Err("compile error".to_string());
                }
                recorder.finish(&phase.id);
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::PhaseFailed { ref phase_id, ref error } if phase_id == "backend" && error == "compile error"
    ));
    let started = recorder.started();
    for later in ["tests", "security", "release"] {
        assert!(!started.contains(&later.to_string()), "{} should not start", later);
    }
}

/// Test: Scheduler events
/// Given an event channel
/// When the diamond is executed
/// Then one LevelStarted per level, one PhaseCompleted per phase and a final
/// AllPhasesComplete are emitted
#[tokio::test]
async fn test_events_trace_execution() {
    let (tx, mut rx) = mpsc::channel(32);
    let scheduler = DependencyGraphScheduler::with_events(tx);

    scheduler
        .execute(&diamond(), |_| async { Ok::<_, String>(()) })
        .await
        .unwrap();
    drop(scheduler);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let levels = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::LevelStarted { .. }))
        .count();
    let completed = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::PhaseCompleted { .. }))
        .count();
    assert_eq!(levels, 3);
    assert_eq!(completed, 4);
    assert_eq!(events.last(), Some(&SchedulerEvent::AllPhasesComplete));
}
