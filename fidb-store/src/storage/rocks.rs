//! RocksDB-backed durable row store, one per signed-in identity.
//!
//! Column families:
//! - `rows`   - row bodies (JSON, LZ4 compressed), keyed by `len | dataset | id`
//! - `outbox` - change batches not yet pushed to the remote, keyed by sequence
//! - `meta`   - schema version, client id and remote cursor (bincode)
//!
//! Every mutation is one atomic `WriteBatch`; after it commits the change
//! batch is published on the store's [`ChangeFeed`]. Row mutations are
//! serialized, so the feed carries batches in commit order.
//!
//! Remote changes are applied last-writer-wins by remote log position, with
//! one exception: a column still waiting in the outbox keeps its local value,
//! since that write will land later in the log than anything pulled now.
//!
//! Reference: Kleppmann - DDIA, Chapter 3 (LSM Trees, SSTables)

use indexmap::IndexMap;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::change::{new_row, Change, ChangeBatch};
use crate::feed::{ChangeFeed, FeedEvent, FeedReceiver, Origin};
use crate::mirror::DatasetRows;
use crate::value::{Row, Value};

type Db = DBWithThreadMode<SingleThreaded>;

/// Column family names.
const CF_ROWS: &str = "rows";
const CF_OUTBOX: &str = "outbox";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ROWS, CF_OUTBOX, CF_META];

const META_KEY: &[u8] = b"meta";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Schema version the caller expects
    pub schema_version: u32,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Events buffered per change-feed receiver
    pub feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fidb_data"),
            schema_version: 1,
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            feed_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
            feed_capacity: 256,
            ..Self::default()
        }
    }
}

/// Store metadata persisted in the `meta` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
    /// Stable id of this local replica, stamped on every push
    pub client_id: Uuid,
    /// Remote position up to which changes were pulled
    pub cursor: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl StoreMeta {
    fn new(schema_version: u32) -> Self {
        let now = now_secs();
        Self {
            schema_version,
            client_id: Uuid::new_v4(),
            cursor: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Another handle holds the database lock
    Blocked(PathBuf),
    /// The handle was closed
    Closed,
    /// The database was written by a newer schema
    VersionTooNew { stored: u32, requested: u32 },
    /// The upgrade hook failed
    UpgradeFailed(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::Blocked(path) => write!(f, "Database blocked: {}", path.display()),
            StoreError::Closed => write!(f, "Database is closed"),
            StoreError::VersionTooNew { stored, requested } => write!(
                f,
                "Database schema version {stored} is newer than requested {requested}"
            ),
            StoreError::UpgradeFailed(e) => write!(f, "Upgrade failed: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

type UpgradeHook = Box<dyn Fn(&RowStore, u32, u32) -> Result<(), StoreError> + Send + Sync>;
type BlockedHook = Box<dyn Fn(&Path) + Send + Sync>;

/// Callbacks invoked while opening a store.
#[derive(Default)]
pub struct OpenHooks {
    on_upgrade: Option<UpgradeHook>,
    on_blocked: Option<BlockedHook>,
}

impl OpenHooks {
    /// Called with `(store, old_version, new_version)` when the stored schema
    /// is older than the requested one. Not called for a fresh database.
    pub fn on_upgrade(
        mut self,
        hook: impl Fn(&RowStore, u32, u32) -> Result<(), StoreError> + Send + Sync + 'static,
    ) -> Self {
        self.on_upgrade = Some(Box::new(hook));
        self
    }

    /// Called when another handle holds the database lock.
    pub fn on_blocked(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.on_blocked = Some(Box::new(hook));
        self
    }

    /// Hooks that only log.
    pub fn logging() -> Self {
        Self::default()
            .on_upgrade(|store, old, new| {
                log::info!(
                    "Upgrading row store {} from schema {old} to {new}",
                    store.path().display()
                );
                Ok(())
            })
            .on_blocked(|path| {
                log::warn!("Row store {} is held by another handle", path.display());
            })
    }
}

/// RocksDB-backed row store.
///
/// The database handle sits behind a lock so that [`RowStore::close`] can
/// release it while other tasks still hold the `Arc<RowStore>`; their later
/// calls fail with [`StoreError::Closed`].
pub struct RowStore {
    db: RwLock<Option<Db>>,
    config: StoreConfig,
    meta: Mutex<StoreMeta>,
    /// Next outbox sequence number
    sequence: AtomicU64,
    /// Held across a row read-modify-write and its feed publish
    write_lock: Mutex<()>,
    feed: ChangeFeed,
}

impl RowStore {
    /// Open the row store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with(config, &OpenHooks::default())
    }

    /// Open the row store, creating it if missing.
    pub fn open_with(config: StoreConfig, hooks: &OpenHooks) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = match Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors) {
            Ok(db) => db,
            Err(e) if e.to_string().to_lowercase().contains("lock") => {
                if let Some(hook) = &hooks.on_blocked {
                    hook(&config.path);
                }
                return Err(StoreError::Blocked(config.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let stored = {
            let cf = Self::cf(&db, CF_META)?;
            match db.get_cf(cf, META_KEY)? {
                Some(bytes) => Some(StoreMeta::decode(&bytes)?),
                None => None,
            }
        };
        if let Some(meta) = &stored {
            if meta.schema_version > config.schema_version {
                return Err(StoreError::VersionTooNew {
                    stored: meta.schema_version,
                    requested: config.schema_version,
                });
            }
        }

        let sequence = Self::recover_sequence(&db);
        let requested = config.schema_version;
        let fresh = stored.is_none();
        let meta = stored.unwrap_or_else(|| StoreMeta::new(requested));
        let old_version = meta.schema_version;
        let feed = ChangeFeed::new(config.feed_capacity);

        let store = Self {
            db: RwLock::new(Some(db)),
            config,
            meta: Mutex::new(meta),
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
            feed,
        };

        if !fresh && old_version < requested {
            if let Some(hook) = &hooks.on_upgrade {
                hook(&store, old_version, requested)?;
            }
        }
        if fresh || old_version < requested {
            store.update_meta(|m| m.schema_version = requested)?;
        }

        Ok(store)
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROWS => {
                // Bodies are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OUTBOX => {
                // Sequential writes, drained front to back
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next outbox sequence number from the last outbox key.
    fn recover_sequence(db: &Db) -> u64 {
        let cf = match db.cf_handle(CF_OUTBOX) {
            Some(cf) => cf,
            None => return 0,
        };
        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => decode_seq(&key).map_or(0, |seq| seq + 1),
            _ => 0,
        }
    }

    /// Release the database handle. Later calls fail with `Closed`.
    pub fn close(&self) {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            log::debug!("Closed row store {}", self.config.path.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    // ─── Rows ─────────────────────────────────────────────────────────

    /// Load every stored row, grouped by dataset.
    pub fn load_all(&self) -> Result<IndexMap<String, DatasetRows>, StoreError> {
        self.with_db(|db| {
            let cf = Self::cf(db, CF_ROWS)?;
            let mut datasets: IndexMap<String, DatasetRows> = IndexMap::new();
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (key, value) = item?;
                let (dataset, id) = decode_row_key(&key)?;
                let row = decode_row(&value)?;
                datasets.entry(dataset).or_default().insert(id, row);
            }
            Ok(datasets)
        })
    }

    pub fn load_row(&self, dataset: &str, id: &str) -> Result<Option<Row>, StoreError> {
        self.with_db(|db| Self::read_row(db, dataset, id))
    }

    fn read_row(db: &Db, dataset: &str, id: &str) -> Result<Option<Row>, StoreError> {
        let cf = Self::cf(db, CF_ROWS)?;
        match db.get_cf(cf, row_key(dataset, id))? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a raw row body, bypassing the feed. For migrations and repair.
    pub fn put_raw_row(&self, dataset: &str, id: &str, row: &Row) -> Result<(), StoreError> {
        self.with_db(|db| {
            let cf = Self::cf(db, CF_ROWS)?;
            db.put_cf_opt(cf, row_key(dataset, id), encode_row(row)?, &self.write_opts())?;
            Ok(())
        })
    }

    /// Apply locally issued changes and queue them in the outbox.
    ///
    /// Returns the outbox sequence number assigned to the batch.
    pub fn apply_local(&self, changes: &[Change]) -> Result<u64, StoreError> {
        let _write = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.with_db(|db| {
            let mut batch = Self::row_batch(db, changes)?;
            let payload = bincode::serde::encode_to_vec(changes, bincode::config::standard())
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            batch.put_cf(Self::cf(db, CF_OUTBOX)?, seq.to_be_bytes(), payload);
            db.write_opt(batch, &self.write_opts())?;
            Ok(seq)
        })?;
        self.feed
            .publish(Origin::Local, ChangeBatch::from_changes(changes));
        Ok(seq)
    }

    /// Apply a page of the remote log and advance the cursor, atomically.
    ///
    /// `changes` is the page in log order, our own pushes included. Only
    /// columns whose value actually changes are written and published, so an
    /// echo of our own push is silent. Returns the number of columns changed.
    pub fn apply_remote(&self, changes: &[Change], cursor: u64) -> Result<usize, StoreError> {
        let _write = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let applied = self.with_db(|db| {
            let pending = Self::pending_columns(db)?;
            let mut incoming = ChangeBatch::new();
            for change in changes {
                let key = (change.dataset.clone(), change.row.clone(), change.column.clone());
                if pending.contains(&key) {
                    log::trace!("Keeping pending local {}/{}/{}", key.0, key.1, key.2);
                    continue;
                }
                incoming.push(change);
            }

            let rows_cf = Self::cf(db, CF_ROWS)?;
            let mut batch = WriteBatch::default();
            let mut applied = ChangeBatch::new();
            for (dataset, id, columns) in incoming.iter() {
                let stored = Self::read_row(db, dataset, id)?;
                let mut row = stored.clone().unwrap_or_else(|| new_row(id));
                let mut touched = false;
                for (column, value) in columns {
                    let current = stored
                        .as_ref()
                        .and_then(|row| row.get(column))
                        .map(Value::from_json);
                    // Stored non-primitives (`Some(None)`) always count as different
                    let unchanged = match (&current, value) {
                        (None, None) => true,
                        (Some(Some(old)), Some(new)) => old == new,
                        _ => false,
                    };
                    if unchanged {
                        continue;
                    }
                    let change = Change {
                        dataset: dataset.to_string(),
                        row: id.to_string(),
                        column: column.clone(),
                        value: value.clone(),
                    };
                    change.apply_to(&mut row);
                    applied.push(&change);
                    touched = true;
                }
                if touched {
                    batch.put_cf(rows_cf, row_key(dataset, id), encode_row(&row)?);
                }
            }

            let mut meta = self.meta();
            meta.cursor = cursor;
            meta.updated_at = now_secs();
            batch.put_cf(Self::cf(db, CF_META)?, META_KEY, meta.encode()?);
            db.write_opt(batch, &self.write_opts())?;
            *self.meta.lock().unwrap_or_else(PoisonError::into_inner) = meta;
            Ok(applied)
        })?;
        let count = applied.len();
        self.feed.publish(Origin::Remote, applied);
        Ok(count)
    }

    /// Build a write batch with the rows touched by `changes`.
    ///
    /// Each row is read once, all its changes applied, then written whole.
    fn row_batch(db: &Db, changes: &[Change]) -> Result<WriteBatch, StoreError> {
        let mut rows: IndexMap<(String, String), Row> = IndexMap::new();
        for change in changes {
            let key = (change.dataset.clone(), change.row.clone());
            if !rows.contains_key(&key) {
                let row = Self::read_row(db, &change.dataset, &change.row)?
                    .unwrap_or_else(|| new_row(&change.row));
                rows.insert(key.clone(), row);
            }
            if let Some(row) = rows.get_mut(&key) {
                change.apply_to(row);
            }
        }

        let cf = Self::cf(db, CF_ROWS)?;
        let mut batch = WriteBatch::default();
        for ((dataset, id), row) in &rows {
            batch.put_cf(cf, row_key(dataset, id), encode_row(row)?);
        }
        Ok(batch)
    }

    /// `(dataset, id, column)` of every change still in the outbox.
    fn pending_columns(db: &Db) -> Result<HashSet<(String, String, String)>, StoreError> {
        let cf = Self::cf(db, CF_OUTBOX)?;
        let mut pending = HashSet::new();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (changes, _): (Vec<Change>, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            pending.extend(
                changes
                    .into_iter()
                    .map(|c| (c.dataset, c.row, c.column)),
            );
        }
        Ok(pending)
    }

    // ─── Outbox ───────────────────────────────────────────────────────

    /// Read up to `limit` outbox entries in sequence order.
    pub fn outbox_read(&self, limit: usize) -> Result<Vec<(u64, Vec<Change>)>, StoreError> {
        self.with_db(|db| {
            let cf = Self::cf(db, CF_OUTBOX)?;
            let mut entries = Vec::new();
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                if entries.len() >= limit {
                    break;
                }
                let (key, value) = item?;
                let Some(seq) = decode_seq(&key) else {
                    continue;
                };
                let (changes, _): (Vec<Change>, _) =
                    bincode::serde::decode_from_slice(&value, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                entries.push((seq, changes));
            }
            Ok(entries)
        })
    }

    /// Delete outbox entries up to and including `up_to_seq`.
    pub fn outbox_truncate(&self, up_to_seq: u64) -> Result<u64, StoreError> {
        self.with_db(|db| {
            let cf = Self::cf(db, CF_OUTBOX)?;
            let mut count = 0u64;
            let mut batch = WriteBatch::default();
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                match decode_seq(&key) {
                    Some(seq) if seq <= up_to_seq => {
                        batch.delete_cf(cf, &key);
                        count += 1;
                    }
                    Some(_) => break,
                    None => continue,
                }
            }
            if count > 0 {
                db.write_opt(batch, &self.write_opts())?;
            }
            Ok(count)
        })
    }

    /// Number of queued outbox entries.
    pub fn outbox_len(&self) -> Result<usize, StoreError> {
        self.with_db(|db| {
            let cf = Self::cf(db, CF_OUTBOX)?;
            let mut count = 0;
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                item?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// Next outbox sequence number.
    pub fn outbox_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn meta(&self) -> StoreMeta {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn client_id(&self) -> Uuid {
        self.meta().client_id
    }

    pub fn cursor(&self) -> u64 {
        self.meta().cursor
    }

    pub fn schema_version(&self) -> u32 {
        self.meta().schema_version
    }

    fn update_meta(&self, f: impl FnOnce(&mut StoreMeta)) -> Result<(), StoreError> {
        self.with_db(|db| {
            let mut meta = self.meta();
            f(&mut meta);
            meta.updated_at = now_secs();
            db.put_cf_opt(Self::cf(db, CF_META)?, META_KEY, meta.encode()?, &self.write_opts())?;
            *self.meta.lock().unwrap_or_else(PoisonError::into_inner) = meta;
            Ok(())
        })
    }

    // ─── Feed ─────────────────────────────────────────────────────────

    /// Subscribe to batches committed by this store.
    pub fn subscribe(&self) -> FeedReceiver {
        self.feed.subscribe()
    }

    /// Subscribe without a buffer limit; batches arrive in commit order.
    pub fn subscribe_unbounded(&self) -> mpsc::UnboundedReceiver<FeedEvent> {
        self.feed.subscribe_unbounded()
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.with_db(|db| {
            db.flush()?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn with_db<T>(&self, f: impl FnOnce(&Db) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::Closed),
        }
    }

    fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a ColumnFamily, StoreError> {
        db.cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

/// Row key: dataset length (4 bytes BE) + dataset + id.
fn row_key(dataset: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + dataset.len() + id.len());
    key.extend_from_slice(&(dataset.len() as u32).to_be_bytes());
    key.extend_from_slice(dataset.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode_row_key(key: &[u8]) -> Result<(String, String), StoreError> {
    let invalid = || StoreError::DeserializationError("Invalid row key".into());
    let len_bytes: [u8; 4] = key.get(..4).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let dataset = key.get(4..4 + len).ok_or_else(invalid)?;
    let id = key.get(4 + len..).ok_or_else(invalid)?;
    Ok((
        String::from_utf8(dataset.to_vec()).map_err(|_| invalid())?,
        String::from_utf8(id.to_vec()).map_err(|_| invalid())?,
    ))
}

fn decode_seq(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn encode_row(row: &Row) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(row).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_row(bytes: &[u8]) -> Result<Row, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_in(dir: &Path) -> RowStore {
        RowStore::open(StoreConfig::for_testing(dir.join("db"))).unwrap()
    }

    #[test]
    fn test_store_open_close() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        assert!(store.path().exists());
        assert!(!store.is_closed());

        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.load_all(), Err(StoreError::Closed)));
        // Closing twice is fine
        store.close();
    }

    #[test]
    fn test_apply_local_writes_rows_and_outbox() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());

        let seq = store
            .apply_local(&[
                Change::set("jedi", "yoda", "name", "yoda"),
                Change::set("jedi", "yoda", "age", 942),
            ])
            .unwrap();
        assert_eq!(seq, 0);

        let row = store.load_row("jedi", "yoda").unwrap().unwrap();
        assert_eq!(row.get("id"), Some(&json!("yoda")));
        assert_eq!(row.get("age"), Some(&json!(942)));

        let outbox = store.outbox_read(10).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].1.len(), 2);
    }

    #[test]
    fn test_load_all_groups_by_dataset() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.apply_local(&[Change::set("jedi", "yoda", "age", 942)]).unwrap();
        store.apply_local(&[Change::set("sith", "vader", "convert", true)]).unwrap();
        store.apply_local(&[Change::set("jedi", "luke", "age", 19)]).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["jedi"].len(), 2);
        assert_eq!(all["sith"]["vader"].get("convert"), Some(&json!(true)));
    }

    #[test]
    fn test_dataset_prefix_is_unambiguous() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.apply_local(&[Change::set("ab", "c", "v", 1)]).unwrap();
        store.apply_local(&[Change::set("a", "bc", "v", 2)]).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all["ab"]["c"].get("v"), Some(&json!(1)));
        assert_eq!(all["a"]["bc"].get("v"), Some(&json!(2)));
    }

    #[test]
    fn test_column_removal_persists() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.apply_local(&[Change::set("jedi", "yoda", "age", 942)]).unwrap();
        store.apply_local(&[Change::remove("jedi", "yoda", "age")]).unwrap();

        let row = store.load_row("jedi", "yoda").unwrap().unwrap();
        assert!(row.get("age").is_none());
        assert_eq!(row.get("id"), Some(&json!("yoda")));
    }

    #[test]
    fn test_outbox_truncate() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        for i in 0..10 {
            store.apply_local(&[Change::set("d", format!("r{i}"), "v", i)]).unwrap();
        }

        let removed = store.outbox_truncate(4).unwrap();
        assert_eq!(removed, 5);

        let remaining = store.outbox_read(100).unwrap();
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].0, 5);
        assert_eq!(store.outbox_len().unwrap(), 5);
    }

    #[test]
    fn test_outbox_sequence_recovery() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        {
            let store = RowStore::open(config.clone()).unwrap();
            store.apply_local(&[Change::set("d", "a", "v", 1)]).unwrap();
            store.apply_local(&[Change::set("d", "b", "v", 2)]).unwrap();
            assert_eq!(store.outbox_sequence(), 2);
        }

        {
            let store = RowStore::open(config).unwrap();
            assert_eq!(store.outbox_sequence(), 2);
            let seq = store.apply_local(&[Change::set("d", "c", "v", 3)]).unwrap();
            assert_eq!(seq, 2);
            assert_eq!(store.outbox_len().unwrap(), 3);
        }
    }

    #[test]
    fn test_meta_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        let client_id = {
            let store = RowStore::open(config.clone()).unwrap();
            store
                .apply_remote(&[Change::set("jedi", "yoda", "age", 942)], 7)
                .unwrap();
            store.client_id()
        };

        let store = RowStore::open(config).unwrap();
        assert_eq!(store.client_id(), client_id);
        assert_eq!(store.cursor(), 7);
        // Remote changes never enter the outbox
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_second_handle_is_blocked() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let _first = RowStore::open(config.clone()).unwrap();

        let blocked = Arc::new(AtomicU32::new(0));
        let counter = blocked.clone();
        let hooks = OpenHooks::default().on_blocked(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let result = RowStore::open_with(config, &hooks);
        assert!(matches!(result, Err(StoreError::Blocked(_))));
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_releases_lock() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let first = RowStore::open(config.clone()).unwrap();
        first.close();
        assert!(RowStore::open(config).is_ok());
    }

    #[test]
    fn test_upgrade_hook_runs_on_version_bump() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::for_testing(dir.path().join("db"));

        // Fresh databases do not trigger the hook
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let hooks = OpenHooks::default().on_upgrade(move |_, old, new| {
            seen.lock().unwrap().push((old, new));
            Ok(())
        });
        drop(RowStore::open_with(config.clone(), &hooks).unwrap());
        assert!(calls.lock().unwrap().is_empty());

        config.schema_version = 3;
        let store = RowStore::open_with(config, &hooks).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![(1, 3)]);
        assert_eq!(store.schema_version(), 3);
    }

    #[test]
    fn test_version_too_new() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::for_testing(dir.path().join("db"));
        config.schema_version = 5;
        drop(RowStore::open(config.clone()).unwrap());

        config.schema_version = 2;
        match RowStore::open(config) {
            Err(StoreError::VersionTooNew { stored, requested }) => {
                assert_eq!(stored, 5);
                assert_eq!(requested, 2);
            }
            other => panic!("expected VersionTooNew, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_raw_rows_may_hold_nested_json() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        let row = json!({"id": "yoda", "friends": ["luke"]});
        store
            .put_raw_row("jedi", "yoda", row.as_object().unwrap())
            .unwrap();
        let loaded = store.load_row("jedi", "yoda").unwrap().unwrap();
        assert_eq!(loaded.get("friends"), Some(&json!(["luke"])));
    }

    #[tokio::test]
    async fn test_feed_receives_local_and_remote() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        let mut rx = store.subscribe();

        store.apply_local(&[Change::set("jedi", "yoda", "age", 942)]).unwrap();
        store.apply_remote(&[Change::set("sith", "vader", "convert", true)], 1).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.origin, Origin::Local);
        assert!(first.batch.row("jedi", "yoda").is_some());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.origin, Origin::Remote);
        assert!(second.batch.row("sith", "vader").is_some());
    }

    #[test]
    fn test_remote_page_last_write_wins() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());

        let applied = store
            .apply_remote(
                &[
                    Change::set("jedi", "yoda", "age", 1),
                    Change::set("jedi", "yoda", "age", 2),
                ],
                2,
            )
            .unwrap();
        assert_eq!(applied, 1);
        let row = store.load_row("jedi", "yoda").unwrap().unwrap();
        assert_eq!(row.get("age"), Some(&json!(2)));
    }

    #[test]
    fn test_remote_skips_columns_pending_in_outbox() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.apply_local(&[Change::set("jedi", "yoda", "age", 2)]).unwrap();

        let applied = store
            .apply_remote(
                &[
                    Change::set("jedi", "yoda", "age", 1),
                    Change::set("jedi", "yoda", "name", "yoda"),
                ],
                2,
            )
            .unwrap();
        assert_eq!(applied, 1);
        let row = store.load_row("jedi", "yoda").unwrap().unwrap();
        assert_eq!(row.get("age"), Some(&json!(2)));
        assert_eq!(row.get("name"), Some(&json!("yoda")));
        assert_eq!(store.cursor(), 2);
    }

    #[tokio::test]
    async fn test_remote_echo_is_silent() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        let seq = store.apply_local(&[Change::set("jedi", "yoda", "age", 942)]).unwrap();
        store.outbox_truncate(seq).unwrap();

        let mut rx = store.subscribe_unbounded();
        let applied = store
            .apply_remote(&[Change::set("jedi", "yoda", "age", 942)], 1)
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(store.cursor(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unbounded_subscription_sees_commit_order() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        let mut rx = store.subscribe_unbounded();

        for i in 0..600 {
            store.apply_remote(&[Change::set("jedi", "yoda", "age", i)], i as u64 + 1).unwrap();
        }
        for i in 0..600 {
            let event = rx.recv().await.unwrap();
            assert_eq!(
                event.batch.column("jedi", "yoda", "age"),
                Some(&Some(Value::from(i)))
            );
        }
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Closed;
        assert!(err.to_string().contains("closed"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
