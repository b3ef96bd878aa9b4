//! Snapshot storage for the vector index and the room registry.
//!
//! Two files in the data directory, always written together:
//!
//! `vectors.bin`
//!
//! Header (51 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - reserved: u32 (zero)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in slot order):
//! - embedding: [f32; dimensions] (little-endian)
//!
//! `rooms.json`
//!
//! `{"version": 1, "vectorsChecksum": <CRC32 of vectors.bin>, "rooms": [...]}`
//! with rooms in slot order. The checksum ties the registry to the exact
//! vectors file it was written with.
//!
//! `save` renames `vectors.bin` first and `rooms.json` second. If the process
//! dies between the two renames, the matching registry is still complete in
//! `rooms.json.tmp` and `load` finishes the rename. Any other mismatch is
//! reported as divergence instead of producing misaligned slots.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::index::VectorIndex;
use crate::semantic::registry::{RegistryError, RoomEntry, RoomRegistry};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + reserved(4) + checksum(4)
const HEADER_SIZE: usize = 51;

const VECTORS_FILE: &str = "vectors.bin";
const ROOMS_FILE: &str = "rooms.json";
const VECTORS_TMP_FILE: &str = "vectors.bin.tmp";
const ROOMS_TMP_FILE: &str = "rooms.json.tmp";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: {0} may be corrupted")]
    ChecksumMismatch(&'static str),

    #[error("Snapshot files diverged: {0}")]
    Diverged(String),

    #[error("Invalid registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("Registry encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A loaded snapshot.
#[derive(Debug)]
pub struct Snapshot {
    /// SHA256 of the model name the vectors were produced with
    pub model_id: [u8; 32],
    pub index: VectorIndex,
    pub registry: RoomRegistry,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomsFileRef<'a> {
    version: u8,
    vectors_checksum: u32,
    rooms: Vec<&'a RoomEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomsFile {
    version: u8,
    vectors_checksum: u32,
    rooms: Vec<RoomEntry>,
}

/// Storage manager for snapshots.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn rooms_path(&self) -> PathBuf {
        self.dir.join(ROOMS_FILE)
    }

    fn vectors_tmp_path(&self) -> PathBuf {
        self.dir.join(VECTORS_TMP_FILE)
    }

    fn rooms_tmp_path(&self) -> PathBuf {
        self.dir.join(ROOMS_TMP_FILE)
    }

    /// Load the snapshot, or `None` if none has been written yet.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let vectors_path = self.vectors_path();

        if !vectors_path.exists() {
            if self.rooms_path().exists() {
                return Err(SnapshotError::Diverged(format!(
                    "{} exists without {}",
                    ROOMS_FILE, VECTORS_FILE
                )));
            }
            return Ok(None);
        }

        let vector_bytes = std::fs::read(&vectors_path)?;
        let rooms = self.load_rooms(crc32fast::hash(&vector_bytes))?;

        if rooms.version > FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch(rooms.version, FORMAT_VERSION));
        }

        let (model_id, index) = Self::decode_vectors(&vector_bytes)?;
        let registry = RoomRegistry::from_entries(rooms.rooms)?;

        if registry.len() != index.len() {
            return Err(SnapshotError::Diverged(format!(
                "{} rooms but {} vectors",
                registry.len(),
                index.len()
            )));
        }

        Ok(Some(Snapshot {
            model_id,
            index,
            registry,
        }))
    }

    /// Read the registry that was written together with the current
    /// `vectors.bin`, completing an interrupted save when that registry is
    /// still sitting in its temp file.
    fn load_rooms(&self, vectors_checksum: u32) -> Result<RoomsFile, SnapshotError> {
        let rooms_path = self.rooms_path();
        let rooms_tmp = self.rooms_tmp_path();

        let current = if rooms_path.exists() {
            Some(Self::read_rooms(&rooms_path)?)
        } else {
            None
        };
        let has_current = current.is_some();

        if let Some(rooms) = current.filter(|r| r.vectors_checksum == vectors_checksum) {
            self.remove_temp_files();
            return Ok(rooms);
        }

        if rooms_tmp.exists() {
            match Self::read_rooms(&rooms_tmp) {
                Ok(pending) if pending.vectors_checksum == vectors_checksum => {
                    log::warn!(
                        "Completing interrupted snapshot write: moving {} into place",
                        ROOMS_TMP_FILE
                    );
                    std::fs::rename(&rooms_tmp, &rooms_path)?;
                    self.sync_dir()?;
                    return Ok(pending);
                }
                Ok(_) => log::debug!("{} belongs to another snapshot, ignoring", ROOMS_TMP_FILE),
                Err(e) => log::warn!("Ignoring unreadable {}: {}", ROOMS_TMP_FILE, e),
            }
        }

        Err(SnapshotError::Diverged(if has_current {
            format!("{} was not written together with {}", ROOMS_FILE, VECTORS_FILE)
        } else {
            format!("{} exists without {}", VECTORS_FILE, ROOMS_FILE)
        }))
    }

    fn read_rooms(path: &Path) -> Result<RoomsFile, SnapshotError> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    /// Save index and registry.
    ///
    /// Both files go to temp files first (write, fsync), then get renamed
    /// into place and the directory is synced. Identical state always
    /// produces identical bytes.
    pub fn save(
        &self,
        index: &VectorIndex,
        registry: &RoomRegistry,
        model_id: &[u8; 32],
    ) -> Result<(), SnapshotError> {
        let vector_bytes = Self::encode_vectors(index, model_id)?;
        let rooms = RoomsFileRef {
            version: FORMAT_VERSION,
            vectors_checksum: crc32fast::hash(&vector_bytes),
            rooms: registry.iter().collect(),
        };
        let room_bytes = serde_json::to_vec_pretty(&rooms)?;

        let vectors_tmp = self.vectors_tmp_path();
        let rooms_tmp = self.rooms_tmp_path();

        let staged = Self::write_synced(&vectors_tmp, &vector_bytes)
            .and_then(|_| Self::write_synced(&rooms_tmp, &room_bytes))
            .and_then(|_| std::fs::rename(&vectors_tmp, self.vectors_path()));

        if let Err(e) = staged {
            // the previous snapshot is untouched
            self.remove_temp_files();
            return Err(e.into());
        }

        // From here on the new vectors are live. A failed rename leaves
        // rooms.json.tmp behind for `load` to complete.
        std::fs::rename(&rooms_tmp, self.rooms_path())?;
        self.sync_dir()?;

        Ok(())
    }

    fn remove_temp_files(&self) {
        for path in [self.vectors_tmp_path(), self.rooms_tmp_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed stale {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> std::io::Result<()> {
        File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(data)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }

    fn encode_vectors(index: &VectorIndex, model_id: &[u8; 32]) -> Result<Vec<u8>, SnapshotError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            SnapshotError::InvalidFormat(format!(
                "{} dimensions do not fit the file format",
                index.dimensions()
            ))
        })?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + index.len() * index.dimensions() * 4);

        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(model_id);
        bytes.extend_from_slice(&dimensions.to_le_bytes());
        bytes.extend_from_slice(&(index.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let checksum = crc32fast::hash(&bytes[..HEADER_SIZE - 4]);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        for vector in index.iter() {
            for value in vector {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }

        Ok(bytes)
    }

    fn decode_vectors(bytes: &[u8]) -> Result<([u8; 32], VectorIndex), SnapshotError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SnapshotError::InvalidFormat(format!(
                "{} is {} bytes, shorter than its header",
                VECTORS_FILE,
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(HEADER_SIZE);

        let version = header[0];
        if version > FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([header[47], header[48], header[49], header[50]]);
        if stored_checksum != crc32fast::hash(&header[..47]) {
            return Err(SnapshotError::ChecksumMismatch(VECTORS_FILE));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header[1..33]);

        let dimensions = u16::from_le_bytes([header[33], header[34]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header[35..43]);
        let entry_count = u64::from_le_bytes(count_bytes) as usize;

        let expected_len = entry_count
            .checked_mul(dimensions)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| SnapshotError::InvalidFormat("entry count overflows".to_string()))?;
        if body.len() != expected_len {
            return Err(SnapshotError::InvalidFormat(format!(
                "expected {} bytes of vectors, found {}",
                expected_len,
                body.len()
            )));
        }

        let mut index = VectorIndex::with_capacity(dimensions, entry_count);
        if dimensions > 0 {
            for chunk in body.chunks_exact(dimensions * 4) {
                let vector = chunk
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                index
                    .push(vector)
                    .map_err(|e| SnapshotError::InvalidFormat(e.to_string()))?;
            }
        }

        Ok((model_id, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn sample_state() -> (VectorIndex, RoomRegistry) {
        let mut index = VectorIndex::new(3);
        let mut registry = RoomRegistry::new();
        for (id, vector) in [
            ("r1", [1.0, 0.0, 0.0]),
            ("r2", [0.0, 1.0, 0.0]),
            ("r3", [0.0, 0.0, 1.0]),
        ] {
            let slot = index.push(vector.to_vec()).unwrap();
            registry
                .insert(id.to_string(), format!("room {id}"), slot)
                .unwrap();
        }
        (index, registry)
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());

        store
            .save(&VectorIndex::new(384), &RoomRegistry::new(), &test_model_id())
            .unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.index.len(), 0);
        assert_eq!(snapshot.index.dimensions(), 384);
        assert!(snapshot.registry.is_empty());
        assert_eq!(snapshot.model_id, test_model_id());
    }

    #[test]
    fn test_save_and_load_reproduces_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (mut index, mut registry) = sample_state();

        // leave a relocated room behind so slot order differs from insertion order
        let removal = registry.remove("r1").unwrap();
        index.swap_remove(removal.entry.slot).unwrap();

        store.save(&index, &registry, &test_model_id()).unwrap();
        let snapshot = store.load().unwrap().unwrap();

        assert_eq!(snapshot.index, index);
        assert_eq!(snapshot.registry, registry);
        assert_eq!(snapshot.registry.get("r3").unwrap().slot, 0);
    }

    #[test]
    fn test_save_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();

        store.save(&index, &registry, &test_model_id()).unwrap();
        let vectors_first = std::fs::read(store.vectors_path()).unwrap();
        let rooms_first = std::fs::read(store.rooms_path()).unwrap();

        store.save(&index, &registry, &test_model_id()).unwrap();
        assert_eq!(std::fs::read(store.vectors_path()).unwrap(), vectors_first);
        assert_eq!(std::fs::read(store.rooms_path()).unwrap(), rooms_first);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();

        store.save(&index, &registry, &test_model_id()).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["rooms.json", "vectors.bin"]);
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let store = SnapshotStore::new(PathBuf::from("/nonexistent/directory"));
        let (index, registry) = sample_state();

        let result = store.save(&index, &registry, &test_model_id());

        assert!(result.is_err());
        assert!(!store.vectors_tmp_path().exists());
    }

    #[test]
    fn test_missing_rooms_file_is_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();

        std::fs::remove_file(store.rooms_path()).unwrap();

        assert!(matches!(store.load(), Err(SnapshotError::Diverged(_))));
    }

    #[test]
    fn test_mismatched_pair_is_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (mut index, mut registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();
        let old_rooms = std::fs::read(store.rooms_path()).unwrap();

        let removal = registry.remove("r2").unwrap();
        index.swap_remove(removal.entry.slot).unwrap();
        store.save(&index, &registry, &test_model_id()).unwrap();

        // simulate a crash after the vectors rename but before the rooms rename
        std::fs::write(store.rooms_path(), old_rooms).unwrap();

        assert!(matches!(store.load(), Err(SnapshotError::Diverged(_))));
    }

    /// Leaves `dir` the way a crash between the two renames of a save of
    /// `next` would: new vectors, old registry, new registry in its temp file.
    fn interrupt_save(store: &SnapshotStore, next: (&VectorIndex, &RoomRegistry)) {
        let old_rooms = std::fs::read(store.rooms_path()).unwrap();
        store.save(next.0, next.1, &test_model_id()).unwrap();
        std::fs::rename(store.rooms_path(), store.rooms_tmp_path()).unwrap();
        std::fs::write(store.rooms_path(), old_rooms).unwrap();
    }

    #[test]
    fn test_load_completes_interrupted_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (mut index, mut registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();

        let removal = registry.remove("r1").unwrap();
        index.swap_remove(removal.entry.slot).unwrap();
        interrupt_save(&store, (&index, &registry));

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.index, index);
        assert_eq!(snapshot.registry, registry);
        assert!(!store.rooms_tmp_path().exists());

        // the completed pair loads cleanly from now on
        let again = store.load().unwrap().unwrap();
        assert_eq!(again.registry, registry);
    }

    #[test]
    fn test_load_completes_interrupted_first_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();
        std::fs::rename(store.rooms_path(), store.rooms_tmp_path()).unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.registry, registry);
        assert!(store.rooms_path().exists());
    }

    #[test]
    fn test_unrelated_temp_registry_is_not_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (mut index, mut registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();
        let first_rooms = std::fs::read(store.rooms_path()).unwrap();

        let removal = registry.remove("r2").unwrap();
        index.swap_remove(removal.entry.slot).unwrap();
        store.save(&index, &registry, &test_model_id()).unwrap();

        // neither registry on disk matches these vectors
        let (mut other_index, _) = sample_state();
        other_index.pop();
        let bytes = SnapshotStore::encode_vectors(&other_index, &test_model_id()).unwrap();
        std::fs::write(store.vectors_path(), bytes).unwrap();
        std::fs::write(store.rooms_tmp_path(), first_rooms).unwrap();

        assert!(matches!(store.load(), Err(SnapshotError::Diverged(_))));
        assert!(store.rooms_tmp_path().exists());
    }

    #[test]
    fn test_load_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();

        // a save that died before its first rename
        std::fs::write(store.vectors_tmp_path(), b"partial").unwrap();
        std::fs::write(store.rooms_tmp_path(), b"{").unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.registry, registry);
        assert!(!store.vectors_tmp_path().exists());
        assert!(!store.rooms_tmp_path().exists());
    }

    #[test]
    fn test_failed_vectors_rename_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();
        let rooms_before = std::fs::read(store.rooms_path()).unwrap();

        // a non-empty directory cannot be replaced by a rename
        std::fs::remove_file(store.vectors_path()).unwrap();
        std::fs::create_dir(store.vectors_path()).unwrap();
        std::fs::write(store.vectors_path().join("blocker"), b"").unwrap();

        assert!(store.save(&index, &registry, &test_model_id()).is_err());
        assert!(!store.vectors_tmp_path().exists());
        assert!(!store.rooms_tmp_path().exists());
        assert_eq!(std::fs::read(store.rooms_path()).unwrap(), rooms_before);
    }

    #[test]
    fn test_failed_rooms_rename_recovers_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (mut index, mut registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();

        std::fs::remove_file(store.rooms_path()).unwrap();
        std::fs::create_dir(store.rooms_path()).unwrap();
        std::fs::write(store.rooms_path().join("blocker"), b"").unwrap();

        let removal = registry.remove("r3").unwrap();
        index.swap_remove(removal.entry.slot).unwrap();
        assert!(store.save(&index, &registry, &test_model_id()).is_err());
        assert!(store.rooms_tmp_path().exists());

        std::fs::remove_dir_all(store.rooms_path()).unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.index, index);
        assert_eq!(snapshot.registry, registry);
    }

    #[test]
    fn test_checksum_detects_header_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let (index, registry) = sample_state();
        store.save(&index, &registry, &test_model_id()).unwrap();

        let mut bytes = std::fs::read(store.vectors_path()).unwrap();
        bytes[10] ^= 0xFF;

        let result = SnapshotStore::decode_vectors(&bytes);
        assert!(matches!(result, Err(SnapshotError::ChecksumMismatch(_))));
    }

    #[test]
    fn test_truncated_vectors_rejected() {
        let (index, _) = sample_state();
        let bytes = SnapshotStore::encode_vectors(&index, &test_model_id()).unwrap();

        let result = SnapshotStore::decode_vectors(&bytes[..bytes.len() - 4]);
        assert!(matches!(result, Err(SnapshotError::InvalidFormat(_))));
    }
}
