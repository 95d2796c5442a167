//! Splitting oversized workloads into bounded units.

mod chunker;

pub use chunker::{
    Chunk, ChunkerConfig, CodebaseInput, WorkloadChunker, DEFAULT_AVG_LOC_PER_FILE,
    DEFAULT_MAX_CHUNK_LOC, DEFAULT_MAX_ITEMS_PER_CHUNK,
};
