//! RocksDB database implementation.

use crate::batch::OperationKind;
use crate::{KeyValueStore, StorageResult, WriteBatch};
use rocksdb::{
    BlockBasedOptions, Cache, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteOptions,
};
use std::path::Path;
use tracing::{debug, info};

/// Default per-database block cache size.
const DEFAULT_CACHE_SIZE: usize = 8 * 1024 * 1024;

/// RocksDB database wrapper holding one ordered keyspace.
pub struct Database {
    db: DBWithThreadMode<MultiThreaded>,
}

impl Database {
    /// Open or create a database at the given path with the default cache.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::open_with_cache(path, DEFAULT_CACHE_SIZE)
    }

    /// Open or create a database with an explicit block-cache budget.
    pub fn open_with_cache<P: AsRef<Path>>(path: P, cache_size: usize) -> StorageResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), cache_size, "opening database");

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(1);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(16 * 1024 * 1024);

        // One shared LRU cache bounds read memory for the whole store.
        let block_cache = Cache::new_lru_cache(cache_size);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&block_cache);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        debug!("database opened");
        Ok(Self { db })
    }

    /// Flush pending memtable writes to disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn write_batch(&self, batch: WriteBatch, sync: bool) -> StorageResult<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.operations {
            match op.kind {
                OperationKind::Put { value } => rocks_batch.put(&op.key, &value),
                OperationKind::Delete => rocks_batch.delete(&op.key),
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        self.db.write_opt(rocks_batch, &write_opts)?;
        Ok(())
    }

    fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward));
        Ok(Box::new(
            iter.filter_map(|r| r.ok())
                .map(|(k, v)| (k.to_vec(), v.to_vec())),
        ))
    }

    fn compact_range(&self, begin: &[u8], end: &[u8]) {
        self.db.compact_range(Some(begin), Some(end));
    }

    fn estimate_size(&self, begin: &[u8], end: &[u8]) -> StorageResult<u64> {
        // Sum the sizes of live SST files whose key range overlaps the
        // query range. Memtable contents are not counted; this is an
        // estimate with the same accuracy class as the backend's own.
        let mut total = 0u64;
        for file in self.db.live_files()? {
            let starts_before_end = match &file.start_key {
                Some(start) => start.as_slice() < end,
                None => true,
            };
            let ends_after_begin = match &file.end_key {
                Some(last) => last.as_slice() >= begin,
                None => true,
            };
            if starts_before_end && ends_after_begin {
                total += file.size as u64;
            }
        }
        Ok(total)
    }
}
