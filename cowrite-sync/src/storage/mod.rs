//! Durable snapshot storage.
//!
//! One record per session, overwritten on every save:
//! ```text
//! ┌──────────────────┬────────────────────────┬──────────────────┐
//! │ session_id (key) │ state_blob             │ updated_at_ms    │
//! │ string           │ full document encoding │ ms since epoch   │
//! └──────────────────┴────────────────────────┴──────────────────┘
//! ```
//!
//! [`RocksSnapshotStore`] keeps records in RocksDB with LZ4-compressed
//! blobs; [`MemorySnapshotStore`] keeps them in a map and can be told to
//! fail, for tests.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Latest durable state of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSnapshot {
    pub session_id: String,
    pub state_blob: Vec<u8>,
    pub updated_at_ms: u64,
}

/// Key/value store for session snapshots.
///
/// Implementations serialize their own access; callers may share one
/// store between sessions.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest snapshot for `session_id`, or `None` if never saved.
    fn get(&self, session_id: &str) -> Result<Option<PersistedSnapshot>, StoreError>;

    /// Insert or overwrite the snapshot for `session_id`.
    fn upsert(&self, session_id: &str, state_blob: &[u8]) -> Result<PersistedSnapshot, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Store temporarily unavailable
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
