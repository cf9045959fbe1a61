//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: one record per session id (bincode), blob LZ4 compressed
//!
//! Upserts are single-key writes, so a crash leaves either the previous
//! or the new snapshot, never a mix.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{now_ms, PersistedSnapshot, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cowrite_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk value for one session.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    updated_at_ms: u64,
    raw_size: u64,
    compressed: Vec<u8>,
}

impl SnapshotRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// RocksDB snapshot store.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column family if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf = ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![cf],
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Blobs are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Remove a session's snapshot. Missing sessions are not an error.
    pub fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.delete_cf(cf, session_id.as_bytes())?;
        Ok(())
    }

    /// All session ids with a stored snapshot.
    pub fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{CF_SNAPSHOTS}' not found")))
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn get(&self, session_id: &str) -> Result<Option<PersistedSnapshot>, StoreError> {
        let cf = self.cf()?;
        let Some(bytes) = self.db.get_cf(cf, session_id.as_bytes())? else {
            return Ok(None);
        };

        let record = SnapshotRecord::decode(&bytes)?;
        let state_blob = lz4_flex::decompress_size_prepended(&record.compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        if state_blob.len() as u64 != record.raw_size {
            return Err(StoreError::CompressionError(format!(
                "size mismatch: expected {} bytes, got {}",
                record.raw_size,
                state_blob.len()
            )));
        }

        Ok(Some(PersistedSnapshot {
            session_id: session_id.to_string(),
            state_blob,
            updated_at_ms: record.updated_at_ms,
        }))
    }

    fn upsert(&self, session_id: &str, state_blob: &[u8]) -> Result<PersistedSnapshot, StoreError> {
        let cf = self.cf()?;
        let record = SnapshotRecord {
            updated_at_ms: now_ms(),
            raw_size: state_blob.len() as u64,
            compressed: lz4_flex::compress_prepend_size(state_blob),
        };

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, session_id.as_bytes(), record.encode()?, &write_opts)?;

        log::debug!(
            "Stored snapshot for {session_id}: {} bytes ({} compressed)",
            record.raw_size,
            record.compressed.len()
        );

        Ok(PersistedSnapshot {
            session_id: session_id.to_string(),
            state_blob: state_blob.to_vec(),
            updated_at_ms: record.updated_at_ms,
        })
    }
}
