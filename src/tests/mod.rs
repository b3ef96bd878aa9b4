use std::path::Path;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::semantic::embeddings::{Embedder, HashingEmbedder};
use crate::semantic::{SearchEngine, SnapshotStore};


pub const TEST_DIMENSIONS: usize = 256;

pub fn hashing_embedder() -> Arc<dyn Embedder> {
    Arc::new(HashingEmbedder::new(TEST_DIMENSIONS))
}

pub fn open_engine_at(dir: &Path, embedder: Arc<dyn Embedder>) -> SearchEngine {
    SearchEngine::open(
        embedder,
        SnapshotStore::new(dir.to_path_buf()),
        SearchConfig::default(),
    )
    .expect("failed to open engine")
}

/// Creates an isolated engine backed by a unique temp directory.
pub fn create_engine() -> (Arc<SearchEngine>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let engine = open_engine_at(tmp.path(), hashing_embedder());
    (Arc::new(engine), tmp)
}
