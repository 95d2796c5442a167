//! Size-bounded, order-preserving chunking of large workloads.
//!
//! All three strategies produce dense 0-based chunk indices, the same
//! `total_chunks` on every chunk of one call, and chunks whose items
//! concatenate back to the input. Empty input yields no chunks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ChunkerSection;
use crate::{klog_debug, klog_warn};

pub const DEFAULT_MAX_CHUNK_LOC: usize = 10_000;
pub const DEFAULT_AVG_LOC_PER_FILE: usize = 100;
pub const DEFAULT_MAX_ITEMS_PER_CHUNK: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk<T> {
    pub items: Vec<T>,
    /// Lines of code for file chunks, item count for generic chunks.
    pub estimated_size: usize,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// A codebase to split. `total_loc` short-circuits when the whole thing fits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodebaseInput {
    pub files: Vec<PathBuf>,
    pub total_loc: Option<usize>,
}

impl CodebaseInput {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            total_loc: None,
        }
    }

    pub fn with_total_loc(mut self, total_loc: usize) -> Self {
        self.total_loc = Some(total_loc);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub max_chunk_loc: usize,
    /// Per-file size estimate used when real sizes are unknown.
    pub avg_loc_per_file: usize,
    pub max_items_per_chunk: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_loc: DEFAULT_MAX_CHUNK_LOC,
            avg_loc_per_file: DEFAULT_AVG_LOC_PER_FILE,
            max_items_per_chunk: DEFAULT_MAX_ITEMS_PER_CHUNK,
        }
    }
}

impl From<&ChunkerSection> for ChunkerConfig {
    fn from(section: &ChunkerSection) -> Self {
        Self {
            max_chunk_loc: section.max_chunk_loc,
            avg_loc_per_file: section.avg_loc_per_file,
            max_items_per_chunk: section.max_items_per_chunk,
        }
    }
}

/// Accumulates items and flushes whenever the next addition would overflow.
struct Accumulator<T> {
    max: usize,
    done: Vec<(Vec<T>, usize)>,
    current: Vec<T>,
    current_size: usize,
}

impl<T> Accumulator<T> {
    fn new(max: usize) -> Self {
        Self {
            max,
            done: Vec::new(),
            current: Vec::new(),
            current_size: 0,
        }
    }

    fn push_group(&mut self, items: impl IntoIterator<Item = T>, size: usize) {
        if !self.current.is_empty() && self.current_size.saturating_add(size) > self.max {
            self.flush();
        }
        self.current.extend(items);
        self.current_size = self.current_size.saturating_add(size);
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.done
                .push((std::mem::take(&mut self.current), self.current_size));
        }
        self.current_size = 0;
    }

    fn finish(mut self) -> Vec<Chunk<T>> {
        self.flush();
        index_chunks(self.done)
    }
}

fn index_chunks<T>(groups: Vec<(Vec<T>, usize)>) -> Vec<Chunk<T>> {
    let total_chunks = groups.len();
    groups
        .into_iter()
        .enumerate()
        .map(|(chunk_index, (items, estimated_size))| Chunk {
            items,
            estimated_size,
            chunk_index,
            total_chunks,
        })
        .collect()
}

fn directory_of(file: &Path) -> PathBuf {
    file.parent().map(Path::to_path_buf).unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadChunker {
    config: ChunkerConfig,
}

impl WorkloadChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split a codebase into chunks of whole directories.
    ///
    /// Directories are grouped in order of first appearance and sized at
    /// `file count * avg_loc_per_file`. A directory is never split, so one
    /// that alone exceeds `max_chunk_loc` becomes an oversize chunk.
    pub fn chunk_large_codebase(
        &self,
        input: &CodebaseInput,
        max_chunk_loc: usize,
    ) -> Vec<Chunk<PathBuf>> {
        if input.files.is_empty() {
            return Vec::new();
        }

        let avg = self.config.avg_loc_per_file;
        let total_loc = input
            .total_loc
            .unwrap_or_else(|| input.files.len().saturating_mul(avg));

        if total_loc <= max_chunk_loc {
            klog_debug!(
                "chunk_large_codebase: {} files ({} LOC) fit in one chunk",
                input.files.len(),
                total_loc
            );
            return index_chunks(vec![(input.files.clone(), total_loc)]);
        }

        let mut order: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();
        let mut by_dir: HashMap<PathBuf, usize> = HashMap::new();
        for file in &input.files {
            let dir = directory_of(file);
            let slot = *by_dir.entry(dir.clone()).or_insert_with(|| {
                order.push((dir, Vec::new()));
                order.len() - 1
            });
            order[slot].1.push(file.clone());
        }

        let mut acc = Accumulator::new(max_chunk_loc);
        for (dir, files) in order {
            let size = files.len().saturating_mul(avg);
            if size > max_chunk_loc {
                klog_warn!(
                    "directory {} (~{} LOC) exceeds chunk bound {}",
                    dir.display(),
                    size,
                    max_chunk_loc
                );
            }
            acc.push_group(files, size);
        }

        let chunks = acc.finish();
        klog_debug!(
            "chunk_large_codebase: {} files -> {} chunks",
            input.files.len(),
            chunks.len()
        );
        chunks
    }

    /// Split files by their real line counts. Files may split across chunks;
    /// only a single file larger than the bound yields an oversize chunk.
    pub fn chunk_by_actual_size(
        &self,
        files: &[(PathBuf, usize)],
        max_chunk_loc: usize,
    ) -> Vec<Chunk<PathBuf>> {
        let mut acc = Accumulator::new(max_chunk_loc);
        for (file, loc) in files {
            if *loc > max_chunk_loc {
                klog_warn!(
                    "file {} ({} LOC) exceeds chunk bound {}",
                    file.display(),
                    loc,
                    max_chunk_loc
                );
            }
            acc.push_group(std::iter::once(file.clone()), *loc);
        }
        acc.finish()
    }

    /// Fixed-size windows over any ordered collection. A bound of 0 is
    /// treated as 1.
    pub fn chunk_items<T: Clone>(&self, items: &[T], max_items_per_chunk: usize) -> Vec<Chunk<T>> {
        let size = max_items_per_chunk.max(1);
        index_chunks(
            items
                .chunks(size)
                .map(|window| (window.to_vec(), window.len()))
                .collect(),
        )
    }
}
