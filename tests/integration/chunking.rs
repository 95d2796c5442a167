//! Workload chunking integration tests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use keel::workload::{ChunkerConfig, CodebaseInput};
use keel::{Chunk, DependencyGraphScheduler, PhaseNode, WorkloadChunker};

fn assert_contract<T: Clone + PartialEq + std::fmt::Debug>(chunks: &[Chunk<T>], input: &[T]) {
    let total = chunks.len();
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert_eq!(chunk.total_chunks, total);
    }
    let flat: Vec<T> = chunks.iter().flat_map(|c| c.items.iter().cloned()).collect();
    assert_eq!(flat, input);
}

/// A sorted listing of a mid-sized repository: 12 directories, 180 files.
fn repository_listing() -> Vec<PathBuf> {
    let dirs = [
        ("crates/api/src", 25),
        ("crates/api/tests", 10),
        ("crates/core/src", 40),
        ("crates/core/src/graph", 12),
        ("crates/core/tests", 8),
        ("crates/storage/src", 20),
        ("crates/storage/migrations", 5),
        ("docs", 15),
        ("scripts", 4),
        ("web/components", 25),
        ("web/pages", 12),
        ("web/styles", 4),
    ];
    dirs.iter()
        .flat_map(|(dir, n)| (0..*n).map(move |i| PathBuf::from(format!("{}/f{:03}.rs", dir, i))))
        .collect()
}

/// Test: Fixed-size windows
/// Given items 0..25 and a window of 10
/// When chunked
/// Then lengths are [10, 10, 5] and flattening reproduces the input
#[test]
fn test_chunk_items_example() {
    let items: Vec<u32> = (0..25).collect();
    let chunks = WorkloadChunker::default().chunk_items(&items, 10);

    assert_eq!(
        chunks.iter().map(|c| c.items.len()).collect::<Vec<_>>(),
        vec![10, 10, 5]
    );
    assert_contract(&chunks, &items);
}

/// Test: Directory-preserving chunks of a real layout
/// Given a sorted repository listing of 18,000 estimated LOC
/// When chunked with a 5,000 LOC bound
/// Then no directory is split, only oversize directories exceed the bound,
/// and the listing is reproduced exactly
#[test]
fn test_codebase_chunks_preserve_directories() {
    let files = repository_listing();
    let chunker = WorkloadChunker::default();
    let chunks = chunker.chunk_large_codebase(&CodebaseInput::new(files.clone()), 5_000);

    assert!(chunks.len() > 1);
    assert_contract(&chunks, &files);

    let mut seen_dirs = HashSet::new();
    for chunk in &chunks {
        let dirs: HashSet<PathBuf> = chunk
            .items
            .iter()
            .map(|f| f.parent().unwrap().to_path_buf())
            .collect();
        for dir in &dirs {
            assert!(seen_dirs.insert(dir.clone()), "{} split across chunks", dir.display());
        }
        if chunk.estimated_size > 5_000 {
            assert_eq!(dirs.len(), 1, "only a lone oversize directory may overflow");
        }
    }
}

/// Test: Small codebase short-circuits
/// Given a known total LOC under the bound
/// When chunked
/// Then a single chunk holds every file
#[test]
fn test_codebase_under_bound_single_chunk() {
    let files = repository_listing();
    let input = CodebaseInput::new(files.clone()).with_total_loc(4_000);
    let chunks = WorkloadChunker::default().chunk_large_codebase(&input, 5_000);

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].total_chunks, 1);
    assert_eq!(chunks[0].items, files);
}

/// Test: Real sizes honor the bound
/// Given files with known line counts, none above the bound
/// When chunked by actual size
/// Then every chunk stays within the bound
#[test]
fn test_actual_size_chunks_within_bound() {
    let files: Vec<(PathBuf, usize)> = repository_listing()
        .into_iter()
        .enumerate()
        .map(|(i, f)| (f, 20 + (i * 37) % 400))
        .collect();
    let chunker = WorkloadChunker::new(ChunkerConfig {
        max_chunk_loc: 2_000,
        ..ChunkerConfig::default()
    });
    let chunks = chunker.chunk_by_actual_size(&files, chunker.config().max_chunk_loc);

    let input: Vec<PathBuf> = files.iter().map(|(f, _)| f.clone()).collect();
    assert_contract(&chunks, &input);
    assert!(chunks.iter().all(|c| c.estimated_size <= 2_000));
    let total: usize = files.iter().map(|(_, loc)| loc).sum();
    assert_eq!(chunks.iter().map(|c| c.estimated_size).sum::<usize>(), total);
}

/// Test: Chunks become phases
/// Given a workload split into chunks
/// When each chunk runs as a phase after a shared setup phase
/// Then every item is processed exactly once
#[tokio::test]
async fn test_chunks_drive_scheduler() {
    let items: Vec<u32> = (0..137).collect();
    let chunks = WorkloadChunker::default().chunk_items(&items, 25);

    let mut phases = vec![PhaseNode::new("setup", &[])];
    for chunk in &chunks {
        phases.push(
            PhaseNode::new(&format!("chunk-{}", chunk.chunk_index), &["setup"])
                .with_config(serde_json::json!({ "items": chunk.items })),
        );
    }
    phases.push(PhaseNode::new(
        "merge",
        &chunks
            .iter()
            .map(|c| format!("chunk-{}", c.chunk_index))
            .collect::<Vec<_>>()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>(),
    ));

    let processed = Arc::new(Mutex::new(Vec::new()));
    DependencyGraphScheduler::new()
        .execute(&phases, |phase| {
            let processed = Arc::clone(&processed);
            async move {
                if let Some(items) = phase.config.get("items").and_then(|v| v.as_array()) {
                    let mut processed = processed.lock().unwrap();
                    processed.extend(items.iter().filter_map(|v| v.as_u64()));
                }
                Ok::<_, String>(())
            }
        })
        .await
        .unwrap();

    let mut processed = processed.lock().unwrap().clone();
    processed.sort();
    assert_eq!(processed, (0..137).collect::<Vec<u64>>());
}
