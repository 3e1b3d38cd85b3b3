// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBIteratorWithThreadMode, Direction, IteratorMode, Options, SnapshotWithThreadMode,
    WriteOptions, DB,
};
use tracing::{info, warn};

use crate::{BatchOp, Partition, StorageError, StorageResult, StoreConfig, WriteBatch};

/// On-disk layout version written to `metadata/schema_version`
pub const SCHEMA_VERSION: u32 = 1;
/// Metadata key holding [`SCHEMA_VERSION`]
pub const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Durable key-value store over RocksDB column families.
///
/// Cheap to clone; clones share the database. Once [`Store::close`] is called
/// every call on every clone, including iterator steps, fails with
/// [`StorageError::Closed`]. The database files are released when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    db: DB,
    closed: AtomicBool,
    sync_writes: bool,
    path: PathBuf,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Store {
    /// Opens the database at `config.path`, creating it and any missing
    /// partition.
    ///
    /// The open runs on a helper thread. If it has not finished within
    /// `config.open_timeout` this returns [`StorageError::Unavailable`].
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        let timeout = config.open_timeout;
        let path = config.path.clone();
        let sync_writes = config.sync_writes;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("quay-store-open".to_string())
            .spawn(move || {
                // The receiver is gone if the caller already timed out.
                let _ = tx.send(open_db(&config));
            })
            .map_err(|e| StorageError::Unavailable(format!("failed to spawn open thread: {e}")))?;

        let db = match rx.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(StorageError::Unavailable(format!(
                    "opening {} took longer than {timeout:?}",
                    path.display()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(StorageError::Unavailable(
                    "open thread exited without a result".to_string(),
                ))
            }
        };

        let store = Self {
            inner: Arc::new(Inner {
                db,
                closed: AtomicBool::new(false),
                sync_writes,
                path,
            }),
        };
        store.check_schema_version()?;
        info!(path = %store.inner.path.display(), "Opened store");
        Ok(store)
    }

    /// Reads a value
    pub fn get(&self, partition: Partition, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.inner.db.get_cf(self.cf(partition)?, key)?)
    }

    /// Whether `key` is present
    pub fn exists(&self, partition: Partition, key: &[u8]) -> StorageResult<bool> {
        self.check_open()?;
        Ok(self
            .inner
            .db
            .get_pinned_cf(self.cf(partition)?, key)?
            .is_some())
    }

    /// Writes a single value
    pub fn put(&self, partition: Partition, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        self.inner
            .db
            .put_cf_opt(self.cf(partition)?, key, value, &self.write_options())?;
        Ok(())
    }

    /// Removes a single value, a no-op if absent
    pub fn delete(&self, partition: Partition, key: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        self.inner
            .db
            .delete_cf_opt(self.cf(partition)?, key, &self.write_options())?;
        Ok(())
    }

    /// Applies every operation of `batch` in one RocksDB write.
    ///
    /// Either all of the batch is visible afterwards, including after a crash,
    /// or none of it is.
    pub fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        self.check_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut wb = rocksdb::WriteBatch::default();
        for op in batch {
            match op {
                BatchOp::Put {
                    partition,
                    key,
                    value,
                } => wb.put_cf(self.cf(partition)?, key, value),
                BatchOp::Delete { partition, key } => wb.delete_cf(self.cf(partition)?, key),
            }
        }
        self.inner.db.write_opt(wb, &self.write_options())?;
        Ok(())
    }

    /// Lazily iterates the keys of `partition` starting with `prefix`, in key order.
    ///
    /// An empty prefix iterates the whole partition. Iteration sees writes made
    /// after it started; use [`Store::snapshot`] for a fixed view.
    pub fn iterate(&self, partition: Partition, prefix: &[u8]) -> StorageResult<PartitionIter<'_>> {
        self.check_open()?;
        let iter = self
            .inner
            .db
            .iterator_cf(self.cf(partition)?, iterator_mode(prefix));
        Ok(PartitionIter::new(iter, prefix, &self.inner.closed))
    }

    /// Number of keys in `partition`
    pub fn count(&self, partition: Partition) -> StorageResult<usize> {
        self.iterate(partition, &[])?
            .try_fold(0, |n, item| item.map(|_| n + 1))
    }

    /// Removes every key of `partition`, returning how many were removed
    pub fn clear_partition(&self, partition: Partition) -> StorageResult<usize> {
        let mut batch = WriteBatch::new();
        for item in self.iterate(partition, &[])? {
            let (key, _) = item?;
            batch.delete(partition, key.into_vec());
        }
        let removed = batch.len();
        self.write_batch(batch)?;
        Ok(removed)
    }

    /// A consistent read-only view as of now. Writers are not blocked.
    pub fn snapshot(&self) -> StorageResult<Snapshot<'_>> {
        self.check_open()?;
        Ok(Snapshot {
            store: self,
            snapshot: self.inner.db.snapshot(),
        })
    }

    /// Flushes memtables of every partition and syncs the WAL
    pub fn flush(&self) -> StorageResult<()> {
        self.check_open()?;
        for partition in Partition::all() {
            self.inner.db.flush_cf(self.cf(partition)?)?;
        }
        self.inner.db.flush_wal(true)?;
        Ok(())
    }

    /// Syncs the WAL and refuses every later call. Closing twice is a no-op.
    pub fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(path = %self.inner.path.display(), "Closing store");
        self.inner.db.flush_wal(true)?;
        Ok(())
    }

    /// Whether [`Store::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn cf(&self, partition: Partition) -> StorageResult<&ColumnFamily> {
        self.inner
            .db
            .cf_handle(partition.name())
            .ok_or_else(|| StorageError::UnknownPartition(partition.name().to_string()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.inner.sync_writes);
        opts
    }

    fn check_schema_version(&self) -> StorageResult<()> {
        match self.get(Partition::Metadata, SCHEMA_VERSION_KEY)? {
            None => self.put(
                Partition::Metadata,
                SCHEMA_VERSION_KEY,
                SCHEMA_VERSION.to_string().as_bytes(),
            ),
            Some(raw) => {
                let version = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| {
                        StorageError::corrupt_record(
                            Partition::Metadata,
                            SCHEMA_VERSION_KEY,
                            "schema version is not a number",
                        )
                    })?;
                if version != SCHEMA_VERSION {
                    warn!(version, expected = SCHEMA_VERSION, "Unsupported store schema");
                    return Err(StorageError::Unavailable(format!(
                        "unsupported schema version {version}, expected {SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn open_db(config: &StoreConfig) -> StorageResult<DB> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_write_buffer_size(config.write_buffer_size);
    opts.set_max_write_buffer_number(config.max_write_buffer_number);
    opts.set_compression_type(DBCompressionType::Snappy);

    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_bloom_filter(10.0, false);
    block_opts.set_block_cache(&Cache::new_lru_cache(config.block_cache_size));
    opts.set_block_based_table_factory(&block_opts);

    let descriptors = Partition::all().map(|partition| {
        let mut cf_opts = Options::default();
        cf_opts.set_compression_type(DBCompressionType::Snappy);
        ColumnFamilyDescriptor::new(partition.name(), cf_opts)
    });

    DB::open_cf_descriptors(&opts, &config.path, descriptors).map_err(|e| match e.kind() {
        rocksdb::ErrorKind::Corruption => StorageError::Corrupt(e.into_string()),
        _ => StorageError::Unavailable(format!(
            "failed to open {}: {}",
            config.path.display(),
            e.into_string()
        )),
    })
}

fn iterator_mode(prefix: &[u8]) -> IteratorMode<'_> {
    if prefix.is_empty() {
        IteratorMode::Start
    } else {
        IteratorMode::From(prefix, Direction::Forward)
    }
}

/// A point-in-time read-only view of the store
pub struct Snapshot<'a> {
    store: &'a Store,
    snapshot: SnapshotWithThreadMode<'a, DB>,
}

impl Snapshot<'_> {
    /// Reads a value as of the snapshot
    pub fn get(&self, partition: Partition, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.store.check_open()?;
        Ok(self.snapshot.get_cf(self.store.cf(partition)?, key)?)
    }

    /// Iterates keys starting with `prefix` as of the snapshot
    pub fn iterate(&self, partition: Partition, prefix: &[u8]) -> StorageResult<PartitionIter<'_>> {
        self.store.check_open()?;
        let iter = self
            .snapshot
            .iterator_cf(self.store.cf(partition)?, iterator_mode(prefix));
        Ok(PartitionIter::new(iter, prefix, &self.store.inner.closed))
    }

    /// Number of keys in `partition` as of the snapshot
    pub fn count(&self, partition: Partition) -> StorageResult<usize> {
        self.iterate(partition, &[])?
            .try_fold(0, |n, item| item.map(|_| n + 1))
    }
}

/// Key-ordered iterator over one prefix of a partition.
///
/// Yields `(key, value)` pairs and ends at the first key outside the prefix.
/// After the first error it yields nothing more.
pub struct PartitionIter<'a> {
    inner: DBIteratorWithThreadMode<'a, DB>,
    prefix: Vec<u8>,
    closed: &'a AtomicBool,
    done: bool,
}

impl<'a> PartitionIter<'a> {
    fn new(inner: DBIteratorWithThreadMode<'a, DB>, prefix: &[u8], closed: &'a AtomicBool) -> Self {
        Self {
            inner,
            prefix: prefix.to_vec(),
            closed,
            done: false,
        }
    }
}

impl Iterator for PartitionIter<'_> {
    type Item = StorageResult<(Box<[u8]>, Box<[u8]>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.closed.load(Ordering::Acquire) {
            self.done = true;
            return Some(Err(StorageError::Closed));
        }
        match self.inner.next()? {
            Ok((key, value)) if key.starts_with(&self.prefix) => Some(Ok((key, value))),
            Ok(_) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}
