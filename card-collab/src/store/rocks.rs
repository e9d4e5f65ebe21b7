//! RocksDB-backed snapshot backend.
//!
//! One key per room (`yjs:card:<id>`), value is the full Yrs state,
//! LZ4-compressed with its uncompressed size prepended. RocksDB calls block,
//! so each one runs on tokio's blocking pool.
//!
//! Tuned for point lookups: bloom filters plus an LRU block cache, since the
//! access pattern is "read once on room creation, overwrite on every edit".

use async_trait::async_trait;
use rocksdb::{BlockBasedOptions, Cache, Options, WriteOptions, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::KvBackend;
use crate::error::{CollabError, Result};

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: f64,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("card_collab_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10.0,
            sync_writes: false,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl RocksConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10.0,
            sync_writes: false,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Durable backend on local disk.
pub struct RocksBackend {
    db: Arc<DB>,
    config: RocksConfig,
}

impl RocksBackend {
    /// Open (or create) the database at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_keep_log_file_num(5);
        opts.set_write_buffer_size(config.write_buffer_size);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DB::open(&opts, &config.path)?;
        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl KvBackend for RocksBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        let stored = tokio::task::spawn_blocking(move || db.get(key.as_bytes()))
            .await
            .map_err(|e| CollabError::Store(e.to_string()))??;

        match stored {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| CollabError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        let sync = self.config.sync_writes;
        let compressed = lz4_flex::compress_prepend_size(&value);

        tokio::task::spawn_blocking(move || {
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(sync);
            db.put_opt(key.as_bytes(), &compressed, &write_opts)
        })
        .await
        .map_err(|e| CollabError::Store(e.to_string()))??;
        Ok(())
    }
}
