//! Snapshot persistence for one session.
//!
//! ```text
//! connect ──► load_into(doc) ──► store.get(session_id)
//!                                   ├── Some(blob) ──► doc.restore_from_full
//!                                   ├── None       ──► empty document
//!                                   └── Err        ──► logged, empty document
//!
//! autosave tick (if dirty) ──┐
//! disconnect ────────────────┴──► store.upsert(session_id, doc.encode_full())
//! ```
//!
//! Saves are last-write-wins on the whole blob. A failed save is logged
//! and retried on the next tick; it never takes the session down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::document::ReplicatedDocument;
use crate::storage::{PersistedSnapshot, SnapshotStore, StoreError};

/// Loads and saves the snapshot of one session.
pub struct PersistenceController {
    store: Arc<dyn SnapshotStore>,
    session_id: String,
    interval: Duration,
    /// Set by document change notifications, cleared by successful saves.
    dirty: Arc<AtomicBool>,
    autosave: Option<JoinHandle<()>>,
}

impl PersistenceController {
    pub fn new(store: Arc<dyn SnapshotStore>, session_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            interval,
            dirty: Arc::new(AtomicBool::new(false)),
            autosave: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    // ─── Load ─────────────────────────────────────────────────────────

    /// Merge the stored snapshot into `doc`.
    ///
    /// Returns `true` if a snapshot was found and applied. A missing
    /// snapshot, a store failure or an undecodable blob all leave `doc`
    /// untouched and return `false`.
    pub fn load_into(&self, doc: &mut ReplicatedDocument) -> bool {
        let snapshot = match self.store.get(&self.session_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                log::debug!("No snapshot for session {}, starting empty", self.session_id);
                return false;
            }
            Err(e) => {
                log::warn!(
                    "Failed to load snapshot for session {}, starting empty: {e}",
                    self.session_id
                );
                return false;
            }
        };

        match doc.restore_from_full(&snapshot.state_blob) {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                log::info!(
                    "Loaded snapshot for session {} ({} bytes, saved at {})",
                    self.session_id,
                    snapshot.state_blob.len(),
                    snapshot.updated_at_ms
                );
                true
            }
            Err(e) => {
                log::error!("Discarding corrupt snapshot for session {}: {e}", self.session_id);
                false
            }
        }
    }

    // ─── Save ─────────────────────────────────────────────────────────

    /// Save the full state of `doc` immediately.
    pub fn save_now(&self, doc: &ReplicatedDocument) -> Result<PersistedSnapshot, StoreError> {
        save_blob(self.store.as_ref(), &self.session_id, &self.dirty, &doc.encode_full())
    }

    /// Flag that the document changed since the last save.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Shared dirty flag, for wiring into a document subscription.
    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        self.dirty.clone()
    }

    // ─── Autosave ─────────────────────────────────────────────────────

    /// Start saving every `interval` while the document is dirty.
    ///
    /// `snapshot` produces the full encoding to save, or `None` once the
    /// owner is gone (which ends the task). Replaces a running autosave.
    pub fn start_autosave<F>(&mut self, snapshot: F)
    where
        F: Fn() -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.stop_autosave();
        if self.interval.is_zero() {
            log::warn!("Autosave disabled for session {}: zero interval", self.session_id);
            return;
        }

        let store = self.store.clone();
        let session_id = self.session_id.clone();
        let dirty = self.dirty.clone();
        let period = self.interval;

        self.autosave = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !dirty.swap(false, Ordering::SeqCst) {
                    continue;
                }
                let Some(blob) = snapshot() else {
                    break;
                };
                // Errors are logged inside; the flag is re-set for the next tick.
                let _ = save_blob(store.as_ref(), &session_id, &dirty, &blob);
            }
            log::debug!("Autosave for session {session_id} finished");
        }));
        log::debug!("Autosave started for session {} every {:?}", self.session_id, period);
    }

    /// Cancel the autosave task. Returns `true` if one was running.
    pub fn stop_autosave(&mut self) -> bool {
        match self.autosave.take() {
            Some(handle) => {
                handle.abort();
                log::debug!("Autosave stopped for session {}", self.session_id);
                true
            }
            None => false,
        }
    }

    pub fn is_autosaving(&self) -> bool {
        self.autosave.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PersistenceController {
    fn drop(&mut self) {
        if let Some(handle) = self.autosave.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PersistenceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceController")
            .field("session_id", &self.session_id)
            .field("interval", &self.interval)
            .field("dirty", &self.is_dirty())
            .field("autosaving", &self.is_autosaving())
            .finish()
    }
}

fn save_blob(
    store: &dyn SnapshotStore,
    session_id: &str,
    dirty: &AtomicBool,
    blob: &[u8],
) -> Result<PersistedSnapshot, StoreError> {
    match store.upsert(session_id, blob) {
        Ok(snapshot) => {
            log::debug!("Saved snapshot for session {session_id} ({} bytes)", blob.len());
            Ok(snapshot)
        }
        Err(e) => {
            dirty.store(true, Ordering::SeqCst);
            log::error!("Failed to save snapshot for session {session_id}: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;

    fn controller(store: &Arc<MemorySnapshotStore>, interval: Duration) -> PersistenceController {
        PersistenceController::new(store.clone(), "s1", interval)
    }

    #[test]
    fn test_load_missing_snapshot_leaves_doc_empty() {
        let store = Arc::new(MemorySnapshotStore::new());
        let persistence = controller(&store, Duration::from_secs(30));
        let mut doc = ReplicatedDocument::new();

        assert!(!persistence.load_into(&mut doc));
        assert!(doc.is_empty());
    }

    #[test]
    fn test_load_failure_is_not_fatal() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.set_fail_loads(true);
        let persistence = controller(&store, Duration::from_secs(30));
        let mut doc = ReplicatedDocument::new();

        assert!(!persistence.load_into(&mut doc));
        assert!(doc.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_discarded() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.upsert("s1", &[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        let persistence = controller(&store, Duration::from_secs(30));
        let mut doc = ReplicatedDocument::new();

        assert!(!persistence.load_into(&mut doc));
        assert!(doc.is_empty());
    }

    #[test]
    fn test_save_then_load_restores_text() {
        let store = Arc::new(MemorySnapshotStore::new());
        let persistence = controller(&store, Duration::from_secs(30));

        let mut doc = ReplicatedDocument::new();
        doc.insert(0, "persisted text").unwrap();
        persistence.save_now(&doc).unwrap();

        let mut restored = ReplicatedDocument::new();
        assert!(persistence.load_into(&mut restored));
        assert_eq!(restored.text(), "persisted text");
        assert_eq!(restored.state_vector(), doc.state_vector());
    }

    #[test]
    fn test_failed_save_keeps_dirty() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.set_fail_saves(true);
        let persistence = controller(&store, Duration::from_secs(30));

        let doc = ReplicatedDocument::new();
        assert!(persistence.save_now(&doc).is_err());
        assert!(persistence.is_dirty());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_autosave_saves_only_when_dirty() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut persistence = controller(&store, Duration::from_millis(10));
        persistence.start_autosave(|| Some(b"blob".to_vec()));
        assert!(persistence.is_autosaving());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.save_count(), 0);

        persistence.mark_dirty();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.save_count(), 1);
        assert!(!persistence.is_dirty());
        assert_eq!(store.get("s1").unwrap().unwrap().state_blob, b"blob");
    }

    #[tokio::test]
    async fn test_autosave_retries_after_failure() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.set_fail_saves(true);
        let mut persistence = controller(&store, Duration::from_millis(10));
        persistence.mark_dirty();
        persistence.start_autosave(|| Some(b"blob".to_vec()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.save_count(), 0);
        assert!(persistence.is_dirty());

        store.set_fail_saves(false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_autosave_cancels_task() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut persistence = controller(&store, Duration::from_millis(10));
        persistence.start_autosave(|| Some(b"blob".to_vec()));

        assert!(persistence.stop_autosave());
        assert!(!persistence.stop_autosave());
        persistence.mark_dirty();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.save_count(), 0);
        assert!(!persistence.is_autosaving());
    }

    #[tokio::test]
    async fn test_zero_interval_disables_autosave() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut persistence = controller(&store, Duration::ZERO);
        persistence.start_autosave(|| Some(Vec::new()));
        assert!(!persistence.is_autosaving());
    }

    #[tokio::test]
    async fn test_autosave_ends_when_owner_is_gone() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut persistence = controller(&store, Duration::from_millis(5));
        persistence.mark_dirty();
        persistence.start_autosave(|| None);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!persistence.is_autosaving());
        assert_eq!(store.save_count(), 0);
    }
}
