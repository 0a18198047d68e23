//! Encrypted-at-rest nearest-neighbor gallery.
//!
//! The whole index travels as one sealed blob, atomically replaced on every
//! mutation. Mutation runs as a transaction over a working copy under the
//! store's write lock; an uncommitted transaction leaves memory and disk
//! untouched, and a failed persist discards the in-memory snapshot so later
//! operations keep reporting the store unavailable until a reload succeeds.

use crate::config::StoreConfig;
use crate::error::{GateError, Result};
use crate::face::{squared_distance, Embedding};
use crate::storage::sealer::BlobSealer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

const INDEX_VERSION: u32 = 1;

/// In-memory gallery of enrolled identity vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    version: u32,
    dimension: u32,
    uids: Vec<String>,
    vectors: Vec<Embedding>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            version: INDEX_VERSION,
            dimension: dimension as u32,
            uids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension as usize
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.uids.iter().any(|u| u == uid)
    }

    /// Closest enrolled vector by squared Euclidean distance, unfiltered.
    pub fn nearest(&self, probe: &[f32]) -> Option<(f32, &str)> {
        let mut best: Option<(f32, &str)> = None;
        for (vector, uid) in self.vectors.iter().zip(self.uids.iter()) {
            let distance = squared_distance(probe, vector);
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, uid));
            }
        }
        best
    }

    pub fn push(&mut self, vector: Embedding, uid: String) -> Result<()> {
        if vector.len() != self.dimension as usize {
            return Err(GateError::Internal(format!(
                "Embedding dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        if self.contains(&uid) {
            return Err(GateError::DuplicateEnrollment(uid));
        }
        self.uids.push(uid);
        self.vectors.push(vector);
        Ok(())
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| GateError::Internal(format!("Index serialization failed: {}", e)))
    }

    fn from_blob_bytes(bytes: &[u8]) -> Result<Self> {
        let index: VectorIndex = bincode::deserialize(bytes)
            .map_err(|e| GateError::Internal(format!("Index deserialization failed: {}", e)))?;
        if index.version != INDEX_VERSION {
            return Err(GateError::Internal(format!(
                "Unsupported index version {}",
                index.version
            )));
        }
        if index.uids.len() != index.vectors.len() {
            return Err(GateError::Internal(
                "Index uid and vector counts disagree".to_string(),
            ));
        }
        Ok(index)
    }
}

/// Durable encrypted store. Searches share a read lock; every mutation
/// serializes behind the write lock for its whole load-mutate-persist
/// cycle.
#[cfg_attr(test, derive(Debug))]
pub struct VectorIndexStore {
    index_path: PathBuf,
    sealer: BlobSealer,
    dimension: usize,
    threshold: f32,
    state: RwLock<Option<VectorIndex>>,
}

impl VectorIndexStore {
    /// Opens the store, seeding an empty index when the blob is absent and
    /// `create_if_missing` is set.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let sealer = BlobSealer::load_or_create(&config.key_path)?;
        let store = Self {
            index_path: config.index_path.clone(),
            sealer,
            dimension: config.dimension,
            threshold: config.match_threshold,
            state: RwLock::new(None),
        };

        if !store.index_path.exists() {
            if !config.create_if_missing {
                return Err(GateError::IndexUnavailable(format!(
                    "Index file missing: {}",
                    store.index_path.display()
                )));
            }
            let empty = VectorIndex::new(store.dimension);
            store.persist(&empty)?;
            tracing::info!(path = %store.index_path.display(), "Seeded empty index");
        }

        let index = store.load_from_disk()?;
        tracing::info!(
            entries = index.len(),
            dimension = index.dimension(),
            "Loaded vector index"
        );
        *store.write_state() = Some(index);
        Ok(store)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Nearest match under the distance threshold, or None for no match.
    pub fn search(&self, probe: &[f32]) -> Result<Option<(f32, String)>> {
        let threshold = self.threshold;
        self.with_index(|index| {
            index
                .nearest(probe)
                .filter(|(distance, _)| *distance < threshold)
                .map(|(distance, uid)| (distance, uid.to_string()))
        })
    }

    pub fn exists(&self, uid: &str) -> Result<bool> {
        self.with_index(|index| index.contains(uid))
    }

    pub fn len(&self) -> Result<usize> {
        self.with_index(|index| index.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends records and persists once, all inside one critical section.
    pub fn add(&self, vectors: Vec<Embedding>, uids: Vec<String>) -> Result<()> {
        if vectors.len() != uids.len() {
            return Err(GateError::Internal(format!(
                "Add called with {} vectors and {} uids",
                vectors.len(),
                uids.len()
            )));
        }
        let mut txn = self.begin_write()?;
        for (vector, uid) in vectors.into_iter().zip(uids.into_iter()) {
            txn.add(vector, uid)?;
        }
        txn.commit()
    }

    /// Opens a single-writer transaction over a working copy of the index.
    /// Dropping the transaction without committing discards its changes.
    pub fn begin_write(&self) -> Result<IndexTxn<'_>> {
        let mut guard = self.write_state();
        if guard.is_none() {
            *guard = Some(self.load_from_disk()?);
        }
        let working = match guard.as_ref() {
            Some(index) => index.clone(),
            None => return Err(GateError::Internal("Index state vanished".to_string())),
        };
        Ok(IndexTxn {
            store: self,
            guard,
            working,
            dirty: false,
        })
    }

    /// Replaces the in-memory index from disk. On failure the store stays
    /// unavailable until a later reload succeeds.
    pub fn reload(&self) -> Result<()> {
        let mut guard = self.write_state();
        match self.load_from_disk() {
            Ok(index) => {
                *guard = Some(index);
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    fn with_index<T>(&self, f: impl FnOnce(&VectorIndex) -> T) -> Result<T> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(index) = state.as_ref() {
                return Ok(f(index));
            }
        }
        // Unavailable: retry the load under the write lock.
        let mut guard = self.write_state();
        if guard.is_none() {
            *guard = Some(self.load_from_disk()?);
        }
        match guard.as_ref() {
            Some(index) => Ok(f(index)),
            None => Err(GateError::Internal("Index state vanished".to_string())),
        }
    }

    fn load_from_disk(&self) -> Result<VectorIndex> {
        let sealed = std::fs::read(&self.index_path).map_err(|e| {
            GateError::IndexUnavailable(format!(
                "Cannot read {}: {}",
                self.index_path.display(),
                e
            ))
        })?;
        let plain = self
            .sealer
            .open(&sealed)
            .map_err(|e| GateError::IndexUnavailable(format!("Cannot open index blob: {}", e)))?;
        let index = VectorIndex::from_blob_bytes(&plain)
            .map_err(|e| GateError::IndexUnavailable(format!("Corrupt index blob: {}", e)))?;
        if index.dimension() != self.dimension {
            return Err(GateError::IndexUnavailable(format!(
                "Index dimension {} does not match configured {}",
                index.dimension(),
                self.dimension
            )));
        }
        Ok(index)
    }

    fn persist(&self, index: &VectorIndex) -> Result<()> {
        let plain = index.to_blob_bytes()?;
        let sealed = self.sealer.seal(&plain)?;
        atomic_write(&self.index_path, &sealed)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<VectorIndex>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write-temp-then-rename so a crash never leaves a torn blob behind.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GateError::Internal(format!("Bad index path: {}", path.display())))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Single-writer critical section over the index. Reads observe staged
/// changes; `commit` persists them and publishes the new snapshot.
pub struct IndexTxn<'a> {
    store: &'a VectorIndexStore,
    guard: RwLockWriteGuard<'a, Option<VectorIndex>>,
    working: VectorIndex,
    dirty: bool,
}

impl IndexTxn<'_> {
    pub fn exists(&self, uid: &str) -> bool {
        self.working.contains(uid)
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    /// Threshold-filtered nearest match against the working copy.
    pub fn search(&self, probe: &[f32]) -> Option<(f32, String)> {
        self.working
            .nearest(probe)
            .filter(|(distance, _)| *distance < self.store.threshold)
            .map(|(distance, uid)| (distance, uid.to_string()))
    }

    pub fn add(&mut self, vector: Embedding, uid: String) -> Result<()> {
        self.working.push(vector, uid)?;
        self.dirty = true;
        Ok(())
    }

    /// Persists staged changes and swaps them into the shared snapshot. A
    /// failed persist drops the snapshot: the store reports unavailable
    /// until a reload succeeds.
    pub fn commit(mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        match self.store.persist(&self.working) {
            Ok(()) => {
                *self.guard = Some(self.working);
                Ok(())
            }
            Err(e) => {
                *self.guard = None;
                Err(GateError::IndexUnavailable(format!(
                    "Index persist failed: {}",
                    e
                )))
            }
        }
    }
}
