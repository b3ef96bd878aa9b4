//! Search engine: the vector index and the room registry behind one lock.
//!
//! Every mutation follows the same sequence under the write lock: change the
//! index, change the registry the same way, persist the snapshot, and undo
//! both changes if persisting fails. After an undo the restored state is
//! written back so the files on disk match memory again.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::config::SearchConfig;
use crate::semantic::embeddings::{EmbeddingError, Embedder};
use crate::semantic::index::{IndexError, VectorIndex};
use crate::semantic::registry::{RoomEntry, RoomRegistry};
use crate::semantic::storage::{SnapshotError, SnapshotStore};

/// Errors surfaced to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("room '{0}' not found")]
    NotFound(String),

    #[error("room '{0}' already exists")]
    Conflict(String),

    #[error("embedding provider error: {0}")]
    Provider(#[from] EmbeddingError),

    #[error("persistence error: {0}")]
    Persistence(#[from] SnapshotError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Provider(_) => "provider",
            EngineError::Persistence(_) => "persistence",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(err: IndexError) -> Self {
        EngineError::Internal(format!("vector index: {err}"))
    }
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub room_id: String,
    pub room_name: String,
    /// Squared L2 distance between query and room name embeddings
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub rooms: usize,
    pub dimensions: usize,
    pub model: String,
}

struct EngineState {
    index: VectorIndex,
    registry: RoomRegistry,
}

pub struct SearchEngine {
    embedder: Arc<dyn Embedder>,
    store: SnapshotStore,
    model_id: [u8; 32],
    search: SearchConfig,
    state: RwLock<EngineState>,
}

impl SearchEngine {
    /// Open the engine over the snapshot in `store`.
    ///
    /// A missing snapshot starts an empty engine. A snapshot written with a
    /// different model is rebuilt by re-embedding every room name and saved
    /// back immediately.
    pub fn open(
        embedder: Arc<dyn Embedder>,
        store: SnapshotStore,
        search: SearchConfig,
    ) -> Result<Self, EngineError> {
        std::fs::create_dir_all(store.dir()).map_err(SnapshotError::from)?;

        let model_id = embedder.model_id_hash();
        let dimensions = embedder.dimensions();

        let state = match store.load()? {
            None => {
                log::info!("No existing snapshot, starting fresh");
                EngineState {
                    index: VectorIndex::new(dimensions),
                    registry: RoomRegistry::new(),
                }
            }
            Some(snapshot)
                if snapshot.model_id == model_id && snapshot.index.dimensions() == dimensions =>
            {
                log::info!("Loaded {} rooms from snapshot", snapshot.registry.len());
                EngineState {
                    index: snapshot.index,
                    registry: snapshot.registry,
                }
            }
            Some(snapshot) => {
                log::warn!(
                    "Model changed, re-embedding {} rooms with '{}'",
                    snapshot.registry.len(),
                    embedder.model_name()
                );
                let index = Self::rebuild_index(embedder.as_ref(), &snapshot.registry)?;
                store.save(&index, &snapshot.registry, &model_id)?;
                EngineState {
                    index,
                    registry: snapshot.registry,
                }
            }
        };

        Ok(Self {
            embedder,
            store,
            model_id,
            search,
            state: RwLock::new(state),
        })
    }

    /// Add a room and persist the snapshot.
    pub fn add_room(&self, room_id: &str, room_name: &str) -> Result<RoomEntry, EngineError> {
        require("roomId", room_id)?;
        require("roomName", room_name)?;

        // skip the embedding call for the common duplicate case
        if self.read_state()?.registry.contains(room_id) {
            return Err(EngineError::Conflict(room_id.to_string()));
        }

        let vector = self.embedder.embed(room_name)?;

        let mut guard = self.write_state()?;
        let state = &mut *guard;

        if state.registry.contains(room_id) {
            return Err(EngineError::Conflict(room_id.to_string()));
        }

        let slot = state.index.push(vector)?;
        let entry = match state
            .registry
            .insert(room_id.to_string(), room_name.to_string(), slot)
        {
            Ok(entry) => entry.clone(),
            Err(e) => {
                state.index.pop();
                return Err(EngineError::Internal(e.to_string()));
            }
        };

        if let Err(e) = self
            .store
            .save(&state.index, &state.registry, &self.model_id)
        {
            log::error!("Failed to persist room '{}', rolling back: {}", room_id, e);
            state.registry.pop();
            state.index.pop();
            self.resync_snapshot(state);
            return Err(e.into());
        }

        log::info!("Added room '{}' at slot {}", entry.room_id, entry.slot);
        Ok(entry)
    }

    /// Delete a room and persist the snapshot.
    ///
    /// The tail vector moves into the freed slot; the room owning it is
    /// re-pointed at its new slot in the same step.
    pub fn delete_room(&self, room_id: &str) -> Result<RoomEntry, EngineError> {
        require("roomId", room_id)?;

        let mut guard = self.write_state()?;
        let state = &mut *guard;

        let removed = state
            .registry
            .remove(room_id)
            .ok_or_else(|| EngineError::NotFound(room_id.to_string()))?;
        let slot = removed.entry.slot;

        let vector_removal = match state.index.swap_remove(slot) {
            Ok(removal) => removal,
            Err(e) => {
                let _ = state.registry.restore(removed.entry);
                return Err(e.into());
            }
        };

        if vector_removal.moved_from != removed.moved_from {
            // index and registry disagree about the tail; put everything back
            let _ = state.index.reinsert(slot, vector_removal.vector);
            let _ = state.registry.restore(removed.entry);
            return Err(EngineError::Internal(format!(
                "slot reconciliation mismatch deleting '{}': index moved {:?}, registry moved {:?}",
                room_id, vector_removal.moved_from, removed.moved_from
            )));
        }

        if let Err(e) = self
            .store
            .save(&state.index, &state.registry, &self.model_id)
        {
            log::error!("Failed to persist deletion of '{}', rolling back: {}", room_id, e);
            state.index.reinsert(slot, vector_removal.vector)?;
            state
                .registry
                .restore(removed.entry)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            self.resync_snapshot(state);
            return Err(e.into());
        }

        if let Some(from) = removed.moved_from {
            log::debug!("Room at slot {} moved to slot {}", from, slot);
        }
        log::info!("Deleted room '{}' from slot {}", room_id, slot);

        Ok(removed.entry)
    }

    /// Find the rooms whose names are closest to `query`.
    ///
    /// `k` defaults to the configured default and is clamped to the
    /// configured maximum.
    pub fn search(&self, query: &str, k: Option<usize>) -> Result<Vec<SearchHit>, EngineError> {
        require("query", query)?;

        let k = k.unwrap_or(self.search.default_k);
        if k == 0 {
            return Err(EngineError::Validation(
                "k must be a positive integer".to_string(),
            ));
        }
        let k = k.min(self.search.max_k);

        let query_vector = self.embedder.embed(query)?;

        let state = self.read_state()?;
        let neighbors = state.index.search(&query_vector, k)?;

        let hits = neighbors
            .into_iter()
            .filter_map(|neighbor| match state.registry.resolve(neighbor.slot) {
                Some(entry) => Some(SearchHit {
                    room_id: entry.room_id.clone(),
                    room_name: entry.room_name.clone(),
                    distance: neighbor.distance,
                }),
                None => {
                    log::error!("Slot {} has no owning room, dropping result", neighbor.slot);
                    None
                }
            })
            .collect();

        Ok(hits)
    }

    /// All rooms in slot order.
    pub fn rooms(&self) -> Result<Vec<RoomEntry>, EngineError> {
        Ok(self.read_state()?.registry.iter().cloned().collect())
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let state = self.read_state()?;
        Ok(EngineStats {
            rooms: state.registry.len(),
            dimensions: state.index.dimensions(),
            model: self.embedder.model_name().to_string(),
        })
    }

    /// Re-write the snapshot from the current state.
    pub fn save(&self) -> Result<(), EngineError> {
        let state = self.read_state()?;
        self.store
            .save(&state.index, &state.registry, &self.model_id)?;
        Ok(())
    }

    /// Best-effort write of the rolled-back state after a failed save, which
    /// may have replaced `vectors.bin` before failing.
    fn resync_snapshot(&self, state: &EngineState) {
        if let Err(e) = self
            .store
            .save(&state.index, &state.registry, &self.model_id)
        {
            log::error!("Failed to restore snapshot after rollback: {}", e);
        }
    }

    fn rebuild_index(
        embedder: &dyn Embedder,
        registry: &RoomRegistry,
    ) -> Result<VectorIndex, EngineError> {
        let mut index = VectorIndex::with_capacity(embedder.dimensions(), registry.len());
        for entry in registry.iter() {
            let slot = index.push(embedder.embed(&entry.room_name)?)?;
            if slot != entry.slot {
                return Err(EngineError::Internal(format!(
                    "rebuilt slot {} for room '{}' registered at {}",
                    slot, entry.room_id, entry.slot
                )));
            }
        }
        Ok(index)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, EngineState>, EngineError> {
        self.state
            .read()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, EngineState>, EngineError> {
        self.state
            .write()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Check that every room's slot holds the embedding of its name.
    #[cfg(test)]
    pub fn is_aligned(&self) -> bool {
        let state = self.state.read().unwrap();
        state.registry.is_consistent()
            && state.index.len() == state.registry.len()
            && state.registry.iter().all(|entry| {
                let expected = self.embedder.embed(&entry.room_name).unwrap();
                state.index.get(entry.slot) == Some(expected.as_slice())
            })
    }
}

fn require(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    Ok(())
}
