//! Checkpoint durability and resume integration tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel::util::blocking;
use keel::{CheckpointStore, DependencyGraphScheduler, Error, PhaseNode, TaskRegistry};

use crate::fixtures::{build_pipeline, temp_store};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhaseState {
    phase: String,
    artifacts: Vec<String>,
}

/// Run `phases`, skipping those already checkpointed and failing `fail_on`.
/// Returns the ids of phases that actually executed.
async fn run_with_checkpoints(
    store: &CheckpointStore,
    phases: &[PhaseNode],
    fail_on: Option<&'static str>,
) -> (Result<(), Error>, Vec<String>) {
    let executed = Arc::new(Mutex::new(Vec::new()));

    let result = DependencyGraphScheduler::new()
        .execute(phases, |phase| {
            let store = store.clone();
            let executed = Arc::clone(&executed);
            async move {
                let key = format!("run/{}", phase.id);
                let lookup = store.clone();
                let lookup_key = key.clone();
                if blocking(move || lookup.load(&lookup_key)).await?.is_some() {
                    return Ok(());
                }
                executed.lock().unwrap().push(phase.id.clone());
                if fail_on == Some(phase.id.as_str()) {
                    return Err(Error::Command(format!("{} broke", phase.id)));
                }
                let state = PhaseState {
                    phase: phase.id.clone(),
                    artifacts: vec![format!("{}.out", phase.id)],
                };
                blocking(move || store.save(&key, "run-1", &state)).await?;
                Ok::<(), Error>(())
            }
        })
        .await
        .map(|_| ());

    let mut executed = executed.lock().unwrap().clone();
    executed.sort();
    (result, executed)
}

/// Test: Resume after failure
/// Given a pipeline run that fails at `backend`
/// When the pipeline is run again with the fault fixed
/// Then only phases without a checkpoint execute the second time
#[tokio::test]
async fn test_resume_skips_checkpointed_phases() {
    let (_dir, _path, store) = temp_store();
    let phases = build_pipeline();

    let (first, ran_first) = run_with_checkpoints(&store, &phases, Some("backend")).await;
    assert!(matches!(first, Err(Error::PhaseFailed { ref phase_id, .. }) if phase_id == "backend"));
    assert!(ran_first.contains(&"backend".to_string()));

    let saved: HashSet<String> = store
        .list()
        .unwrap()
        .into_iter()
        .map(|cp| cp.task_id)
        .collect();
    for done in ["requirements", "design", "schema", "frontend", "docs"] {
        assert!(saved.contains(&format!("run/{}", done)), "{} not saved", done);
    }
    assert!(!saved.contains("run/backend"));

    let (second, ran_second) = run_with_checkpoints(&store, &phases, None).await;
    second.unwrap();
    assert_eq!(ran_second, vec!["backend", "release", "security", "tests"]);

    let cp = store.load("run/release").unwrap().unwrap();
    let state: PhaseState = cp.decode().unwrap();
    assert_eq!(state.phase, "release");
    assert_eq!(state.artifacts, vec!["release.out"]);
}

/// Test: Checkpoints survive a restart
/// Given checkpoints saved through one handle
/// When the database is reopened
/// Then the latest state for each task is loaded
#[test]
fn test_checkpoints_survive_reopen() {
    let (_dir, path, store) = temp_store();
    store.save("task-1", "tok1", &vec!["a"]).unwrap();
    store.save("task-1", "tok2", &vec!["a", "b"]).unwrap();
    store.save("task-2", "tok1", &42).unwrap();
    drop(store);

    let reopened = CheckpointStore::open(&path).unwrap();
    let cp = reopened.load("task-1").unwrap().unwrap();
    assert_eq!(cp.token, "tok2");
    assert_eq!(cp.decode::<Vec<String>>().unwrap(), vec!["a", "b"]);
    assert_eq!(reopened.stats().unwrap().total, 2);
}

/// Test: Concurrent saves keep one checkpoint per task
/// Given many writers saving the same task concurrently
/// When they all finish
/// Then exactly one checkpoint exists and it holds one writer's data
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_upsert() {
    let (_dir, _path, store) = temp_store();

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            blocking(move || store.save("shared", &format!("tok{}", i), &i)).await
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }

    assert_eq!(ids.len(), 1);
    let stats = store.stats().unwrap();
    assert_eq!(stats.total, 1);
    let cp = store.load("shared").unwrap().unwrap();
    let value: u32 = cp.decode().unwrap();
    assert_eq!(cp.token, format!("tok{}", value));
}

/// Test: Retention cleanup respects active tasks
/// Given expired checkpoints for running, pending and completed tasks
/// When cleanup runs
/// Then only checkpoints of inactive tasks are removed
#[tokio::test]
async fn test_cleanup_respects_registry() {
    let (_dir, _path, store) = temp_store();
    let mut registry = TaskRegistry::new();

    for task in ["running", "pending", "completed", "unknown"] {
        store.save(task, "tok", &task).unwrap();
    }
    registry.register("running");
    registry.start("running");
    registry.register("pending");
    registry.register("completed");
    registry.complete("completed");

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.cleanup(7, &registry).unwrap(), 0);
    assert_eq!(store.cleanup(0, &registry).unwrap(), 2);

    let remaining: HashSet<String> = store
        .list()
        .unwrap()
        .into_iter()
        .map(|cp| cp.task_id)
        .collect();
    assert_eq!(
        remaining,
        HashSet::from(["running".to_string(), "pending".to_string()])
    );
}
