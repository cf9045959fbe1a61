//! In-memory snapshot store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{now_ms, PersistedSnapshot, SnapshotStore, StoreError};

/// Map-backed store with switchable failures.
#[derive(Default)]
pub struct MemorySnapshotStore {
    records: Mutex<HashMap<String, PersistedSnapshot>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    saves: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` fail until reset.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every `upsert` fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Successful upserts so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, session_id: &str) -> Result<Option<PersistedSnapshot>, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("loads disabled".into()));
        }
        Ok(self.records.lock().get(session_id).cloned())
    }

    fn upsert(&self, session_id: &str, state_blob: &[u8]) -> Result<PersistedSnapshot, StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("saves disabled".into()));
        }
        let snapshot = PersistedSnapshot {
            session_id: session_id.to_string(),
            state_blob: state_blob.to_vec(),
            updated_at_ms: now_ms(),
        };
        self.records
            .lock()
            .insert(session_id.to_string(), snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(snapshot)
    }
}
