//! RocksDB-backed transactional store.
//!
//! Column families (one per partition):
//! - `proposals`: trading proposals (JSON, keyed by proposal UUID)
//! - `users`: public user profiles
//! - `chat`: chat buckets plus the last-bucket pointer
//! - `dynamic`: frequently changing proposal state
//! - `private`: password hashes
//!
//! Reads hit RocksDB directly from the calling task and never queue or wait
//! on a write in progress; the only lock on the read path is a brief shared
//! lock on the database handle, taken exclusively only by `close`. Every
//! mutation is a closure executed by the [`SerialWriter`], so at most one
//! write transaction is open at any time and all mutations are totally ordered.
//!
//! Reference: Kleppmann, DDIA, Chapter 7 (Actual Serial Execution)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use super::chat;
use super::modifier::{BucketModifier, Modifier};
use super::writer::SerialWriter;

pub(crate) type Db = DBWithThreadMode<SingleThreaded>;

/// The closed set of partitions created at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Proposals,
    Users,
    Chat,
    Dynamic,
    Private,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::Private,
        Partition::Proposals,
        Partition::Users,
        Partition::Chat,
        Partition::Dynamic,
    ];

    /// Column family name on disk.
    pub fn name(self) -> &'static str {
        match self {
            Partition::Proposals => "proposals",
            Partition::Users => "users",
            Partition::Chat => "chat",
            Partition::Dynamic => "dynamic",
            Partition::Private => "private",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Partition {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Partition::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| StoreError::UnknownPartition(s.to_string()))
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Pending write transactions the writer queue holds before submitters wait (default: 64)
    pub writer_queue_capacity: usize,
    /// fsync on every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per partition (default: 16MB)
    pub write_buffer_size: usize,
    /// Block cache shared by all partitions (default: 64MB)
    pub block_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("union_data"),
            writer_queue_capacity: 64,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            block_cache_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer_queue_capacity: 16,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
            block_cache_size: 4 * 1024 * 1024,
        }
    }

    /// Defaults, with the data directory taken from `UNION_DATA_DIR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("UNION_DATA_DIR") {
            config.path = PathBuf::from(dir);
        }
        config
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Key absent from the partition
    #[error("key not found in partition '{0}'")]
    NotFound(Partition),
    /// A bucket modifier refused the entry because the bucket is at capacity
    #[error("bucket is full")]
    BucketFull,
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(String),
    /// Partition name outside the known set, or its handle is missing
    #[error("unknown partition '{0}'")]
    UnknownPartition(String),
    #[error("store is closed")]
    Closed,
    /// The transaction body failed in a way that is not a store error
    #[error("transaction aborted: {0}")]
    Aborted(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// A modifier rejected the current value
    #[error("modifier rejected value: {0}")]
    Rejected(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Where an append landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Key of the bucket that received the entry
    pub bucket: Vec<u8>,
    /// True when the previous head was full and a new bucket was started
    pub rolled_over: bool,
}

/// A write transaction: reads see committed state overlaid with this
/// transaction's own puts; puts become visible atomically on commit.
pub struct WriteTxn<'a> {
    db: &'a Db,
    batch: WriteBatch,
    pending: HashMap<(Partition, Vec<u8>), Vec<u8>>,
}

impl<'a> WriteTxn<'a> {
    fn new(db: &'a Db) -> Self {
        Self {
            db,
            batch: WriteBatch::default(),
            pending: HashMap::new(),
        }
    }

    pub fn get(&self, partition: Partition, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        if let Some(value) = self.pending.get(&(partition, key.to_vec())) {
            return Ok(value.clone());
        }
        let cf = cf_handle(self.db, partition)?;
        self.db
            .get_cf(cf, key)?
            .ok_or(StoreError::NotFound(partition))
    }

    pub fn put(&mut self, partition: Partition, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = cf_handle(self.db, partition)?;
        self.batch.put_cf(cf, key, value);
        self.pending.insert((partition, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn commit(self, opts: &WriteOptions) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.db.write_opt(self.batch, opts)?;
        Ok(())
    }
}

/// Run `body` as one transaction; nothing is committed unless it returns `Ok`.
pub(crate) fn run_txn<T, F>(db: &Db, opts: &WriteOptions, body: F) -> Result<T, StoreError>
where
    F: FnOnce(&mut WriteTxn<'_>) -> Result<T, StoreError>,
{
    let mut txn = WriteTxn::new(db);
    let out = body(&mut txn)?;
    txn.commit(opts)?;
    Ok(out)
}

pub(crate) fn write_options(sync: bool) -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(sync);
    opts
}

fn cf_handle(db: &Db, partition: Partition) -> Result<&ColumnFamily, StoreError> {
    db.cf_handle(partition.name())
        .ok_or_else(|| StoreError::UnknownPartition(partition.name().to_string()))
}

/// Transactional key-value store.
///
/// Share it as `Arc<Store>`; reads are non-blocking from any task, mutations are
/// funnelled through the writer thread.
pub struct Store {
    /// `None` once closed
    db: RwLock<Option<Arc<Db>>>,
    writer: SerialWriter,
    config: StoreConfig,
}

impl Store {
    /// Open the store at the configured path.
    ///
    /// Creates the database, every partition and the first chat bucket if
    /// they don't exist, then starts the writer thread.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Partition::ALL
            .iter()
            .map(|p| ColumnFamilyDescriptor::new(p.name(), Self::cf_options(*p, &config, &cache)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;

        // Resolve every handle up front so a missing one is a config error now.
        for partition in Partition::ALL {
            cf_handle(&db, partition)?;
        }

        // The writer is not running yet, so this is the only transaction in flight.
        if run_txn(&db, &write_options(config.sync_writes), chat::seed)? {
            log::info!("Seeded chat log at {}", config.path.display());
        }

        let db = Arc::new(db);
        let writer = SerialWriter::spawn(
            db.clone(),
            config.writer_queue_capacity,
            config.sync_writes,
        )?;

        log::info!("Store opened at {}", config.path.display());
        Ok(Self {
            db: RwLock::new(Some(db)),
            writer,
            config,
        })
    }

    fn cf_options(partition: Partition, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match partition {
            // The head bucket is rewritten on every chat message
            Partition::Chat | Partition::Dynamic => opts.set_max_write_buffer_number(4),
            _ => opts.set_max_write_buffer_number(2),
        }

        opts
    }

    fn handle(&self) -> Result<Arc<Db>, StoreError> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::Closed)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Read the latest committed value for `key`.
    ///
    /// Never waits for the writer; a transaction still in flight is invisible.
    pub fn read(&self, partition: Partition, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let db = self.handle()?;
        let cf = cf_handle(&db, partition)?;
        db.get_cf(cf, key)?.ok_or(StoreError::NotFound(partition))
    }

    // ─── Mutations (serialized) ───────────────────────────────────────

    /// Upsert `value` at `key`.
    pub async fn write(
        &self,
        partition: Partition,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let (key, value) = (key.into(), value.into());
        self.writer
            .submit(move |txn| txn.put(partition, &key, &value))
            .await
    }

    /// Read-modify-write `key` through `modifier` in one transaction.
    ///
    /// A missing key is `NotFound`; a modifier error aborts without writing.
    pub async fn modify<M: Modifier>(
        &self,
        partition: Partition,
        key: impl Into<Vec<u8>>,
        modifier: M,
    ) -> Result<(), StoreError> {
        let key = key.into();
        self.writer
            .submit(move |txn| {
                let current = txn.get(partition, &key)?;
                let updated = modifier.apply(&current)?;
                txn.put(partition, &key, &updated)
            })
            .await
    }

    /// Append to the bucket that `pointer` names, starting a new bucket when
    /// the modifier reports [`StoreError::BucketFull`].
    ///
    /// The new bucket gets a fresh UUID key and `pointer` is moved to it in
    /// the same transaction.
    pub async fn append<M: BucketModifier>(
        &self,
        partition: Partition,
        pointer: impl Into<Vec<u8>>,
        modifier: M,
    ) -> Result<AppendOutcome, StoreError> {
        let pointer = pointer.into();
        self.writer
            .submit(move |txn| {
                let head = txn.get(partition, &pointer)?;
                let bucket = txn.get(partition, &head)?;
                match modifier.apply(&bucket) {
                    Ok(updated) => {
                        txn.put(partition, &head, &updated)?;
                        Ok(AppendOutcome {
                            bucket: head,
                            rolled_over: false,
                        })
                    }
                    Err(StoreError::BucketFull) => {
                        let fresh = Uuid::new_v4().as_bytes().to_vec();
                        let first = modifier.start_bucket(&head)?;
                        txn.put(partition, &fresh, &first)?;
                        txn.put(partition, &pointer, &fresh)?;
                        Ok(AppendOutcome {
                            bucket: fresh,
                            rolled_over: true,
                        })
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Close the store.
    ///
    /// New operations fail with [`StoreError::Closed`] immediately. Work the
    /// writer already accepted is completed and answered; this returns once
    /// the writer thread has exited. Idempotent.
    pub async fn close(&self) {
        let released = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.writer.shutdown().await;
        if released.is_some() {
            log::info!("Store at {} closed", self.config.path.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Without an executor we cannot wait for the writer; it releases its
        // database handle as soon as it drains the queue.
        self.db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.writer.detach();
    }
}
