//! RocksDB backend for the node's write-through storage.

use std::path::Path;

use log::debug;
use rocksdb::{Direction, IteratorMode, WriteBatch as RocksBatch, DB};

use devchain::error::{ChainError, ChainResult};
use devchain::storage::{BatchOp, KvStore, WriteBatch};

fn backend_err(e: rocksdb::Error) -> ChainError {
    ChainError::Storage(e.to_string())
}

pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    pub fn new(db: DB) -> Self {
        Self { db }
    }

    /// Opens (or creates) the database at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let db = DB::open_default(path).map_err(backend_err)?;
        Ok(Self::new(db))
    }

    pub fn db(&self) -> &DB {
        &self.db
    }
}

impl KvStore for RocksKv {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        self.db.get(key).map_err(backend_err)
    }

    fn write_batch(&self, batch: WriteBatch) -> ChainResult<()> {
        let n = batch.len();
        let mut wb = RocksBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => wb.put(k, v),
                BatchOp::Delete(k) => wb.delete(k),
            }
        }
        self.db.write(wb).map_err(backend_err)?;
        debug!("rocksdb: wrote batch of {} ops", n);
        Ok(())
    }

    fn scan(
        &self, start: &[u8], end: &[u8],
    ) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new())
        }
        Ok(self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward))
            .take_while(|(k, _)| &k[..] < end)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect())
    }
}
