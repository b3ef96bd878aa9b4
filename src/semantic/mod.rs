//! Semantic room search.
//!
//! Room names are embedded into vectors and kept in an exact L2 index; a
//! registry maps external room ids to index slots.
//!
//! # Architecture
//!
//! - `embeddings`: Embedding providers (fastembed, token hashing, timeout wrapper)
//! - `index`: Flat L2 vector index with compacting removal
//! - `registry`: room id <-> slot mapping that follows the index's removals
//! - `storage`: Snapshot persistence (vectors.bin + rooms.json)
//! - `engine`: Search engine owning index and registry behind one lock

pub mod embeddings;
mod engine;
mod index;
mod registry;
mod storage;

pub use engine::{EngineError, EngineStats, SearchEngine, SearchHit};
pub use registry::RoomEntry;
pub use storage::SnapshotStore;
