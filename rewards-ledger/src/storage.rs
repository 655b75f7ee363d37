//! Storage layer using RocksDB pessimistic transactions
//!
//! # Column Families
//!
//! - `entries` - Append-only ledger entries (key: entry_id)
//! - `idempotency` - Uniqueness index (key: idempotency_key -> entry_id)
//! - `wallets` - Denormalized balances (key: user || currency)
//! - `user_entries` - Per-user history (key: user || created_at || entry_id)
//! - `wallet_entries` - Per-wallet chain (key: user || currency || sequence -> entry_id)
//! - `streaks` - Streak state (key: user)
//!
//! Every read-modify-write goes through [`StoreTxn`]. Rows are locked with
//! `get_for_update`, so two transactions touching the same wallet, streak or
//! idempotency key serialize; a dropped transaction rolls back.

use crate::{
    error::{Error, Result},
    types::{CurrencyType, LedgerEntry, StreakState, UserId, WalletRecord},
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, SingleThreaded, Transaction, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use serde::de::DeserializeOwned;
use std::ops::ControlFlow;
use std::path::PathBuf;
use uuid::Uuid;

/// Column family names
const CF_ENTRIES: &str = "entries";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_WALLETS: &str = "wallets";
const CF_USER_ENTRIES: &str = "user_entries";
const CF_WALLET_ENTRIES: &str = "wallet_entries";
const CF_STREAKS: &str = "streaks";

type Db = TransactionDB<SingleThreaded>;

/// Position in a user's history: `created_at` nanos and entry id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HistoryPosition {
    /// `created_at` in nanoseconds since the Unix epoch
    pub created_at_nanos: i64,
    /// Entry id
    pub entry_id: Uuid,
}

impl HistoryPosition {
    /// Position of an entry
    pub fn of(entry: &LedgerEntry) -> Self {
        Self {
            created_at_nanos: entry.created_at.timestamp_nanos_opt().unwrap_or(0),
            entry_id: entry.id,
        }
    }

    /// Opaque cursor string
    pub fn to_cursor(&self) -> String {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&self.created_at_nanos.to_be_bytes());
        bytes.extend_from_slice(self.entry_id.as_bytes());
        hex::encode(bytes)
    }

    /// Parse a cursor produced by [`HistoryPosition::to_cursor`]
    pub fn from_cursor(cursor: &str) -> Result<Self> {
        let bytes = hex::decode(cursor)
            .map_err(|_| Error::InvalidRequest(format!("Invalid cursor: {}", cursor)))?;
        if bytes.len() != 24 {
            return Err(Error::InvalidRequest(format!("Invalid cursor: {}", cursor)));
        }

        let mut nanos = [0u8; 8];
        nanos.copy_from_slice(&bytes[..8]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[8..]);

        Ok(Self {
            created_at_nanos: i64::from_be_bytes(nanos),
            entry_id: Uuid::from_bytes(id),
        })
    }
}

/// Strictly increasing wall clock for `created_at`
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_nanos: Mutex<i64>,
}

impl MonotonicClock {
    /// Current time, strictly after every value returned before
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let mut last = self.last_nanos.lock();
        let next = if wall > *last { wall } else { *last + 1 };
        *last = next;
        DateTime::from_timestamp_nanos(next)
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Db,
    path: PathBuf,
    clock: MonotonicClock,
    lock_timeout_ms: i64,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        tracing::info!(path = ?self.path, "Closing RocksDB transaction store");
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.transactions.lock_timeout_ms);
        txn_db_opts.set_default_lock_timeout(config.transactions.lock_timeout_ms);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_WALLETS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_USER_ENTRIES, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_WALLET_ENTRIES, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_STREAKS, Self::cf_options_state()),
        ];

        let db: Db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            lock_timeout_ms = config.transactions.lock_timeout_ms,
            "Opened RocksDB transaction store"
        );

        Ok(Self {
            db,
            path: path.clone(),
            clock: MonotonicClock::default(),
            lock_timeout_ms: config.transactions.lock_timeout_ms,
        })
    }

    // Column family options

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lookup() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        // Point lookups on every write benefit from bloom filters
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Begin a pessimistic transaction
    pub fn begin(&self) -> StoreTxn<'_> {
        let write_opts = WriteOptions::default();
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_deadlock_detect(true);

        StoreTxn {
            storage: self,
            txn: self.db.transaction_opt(&write_opts, &txn_opts),
        }
    }

    /// Next `created_at` value
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // Entry reads (entries are immutable, no locking needed)

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        self.db
            .get_cf(cf, entry_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Get the committed entry for an idempotency key
    pub fn find_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_IDEMPOTENCY)?;
        match self.db.get_cf(cf, idempotency_key.as_bytes())? {
            Some(id_bytes) => self.resolve_index(idempotency_key, &id_bytes).map(Some),
            None => Ok(None),
        }
    }

    fn resolve_index(&self, idempotency_key: &str, id_bytes: &[u8]) -> Result<LedgerEntry> {
        let entry_id = decode_uuid(id_bytes)?;
        self.get_entry(entry_id)?.ok_or_else(|| {
            Error::InvariantViolation(format!(
                "Idempotency key {} points to missing entry {}",
                idempotency_key, entry_id
            ))
        })
    }

    // Wallet and streak reads (committed state, no locking)

    /// Get wallet row
    pub fn get_wallet(&self, user_id: &UserId, currency: CurrencyType) -> Result<Option<WalletRecord>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        self.db
            .get_cf(cf, wallet_key(user_id, currency))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Get streak row
    pub fn get_streak(&self, user_id: &UserId) -> Result<Option<StreakState>> {
        let cf = self.cf_handle(CF_STREAKS)?;
        self.db
            .get_cf(cf, user_key(user_id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    // History scans

    /// Visit a user's entries newest first, strictly before `before` when
    /// given, until `visit` breaks.
    pub fn scan_user_entries<F>(
        &self,
        user_id: &UserId,
        before: Option<HistoryPosition>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(LedgerEntry) -> Result<ControlFlow<()>>,
    {
        let cf = self.cf_handle(CF_USER_ENTRIES)?;
        let prefix = user_key(user_id);

        let start = match before {
            Some(position) => user_entry_key(user_id, position),
            None => {
                let mut key = prefix.clone();
                key.extend_from_slice(&[0xFF; 24]);
                key
            }
        };

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if before.is_some() && key[..] >= start[..] {
                continue;
            }

            let entry_id = decode_uuid(&key[key.len() - 16..])?;
            let entry = self.get_entry(entry_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!("History index points to missing entry {}", entry_id))
            })?;

            if visit(entry)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    /// A wallet's entries in chain order
    pub fn wallet_entries(&self, user_id: &UserId, currency: CurrencyType) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_WALLET_ENTRIES)?;
        let prefix = wallet_key(user_id, currency);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            let entry_id = decode_uuid(&value)?;
            let entry = self.get_entry(entry_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!("Chain index points to missing entry {}", entry_id))
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

/// Open read-modify-write transaction against the store
pub struct StoreTxn<'a> {
    storage: &'a Storage,
    txn: Transaction<'a, Db>,
}

impl std::fmt::Debug for StoreTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTxn").finish_non_exhaustive()
    }
}

impl<'a> StoreTxn<'a> {
    /// Next `created_at` value
    pub fn now(&self) -> DateTime<Utc> {
        self.storage.now()
    }

    /// Lock an idempotency key and return its entry, if committed
    pub fn entry_for_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let cf = self.storage.cf_handle(CF_IDEMPOTENCY)?;
        match self.txn.get_for_update_cf(cf, idempotency_key.as_bytes(), true)? {
            Some(id_bytes) => {
                let entry_id = decode_uuid(&id_bytes)?;
                let cf_entries = self.storage.cf_handle(CF_ENTRIES)?;
                let bytes = self.txn.get_cf(cf_entries, entry_id.as_bytes())?.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "Idempotency key {} points to missing entry {}",
                        idempotency_key, entry_id
                    ))
                })?;
                decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Lock and read a wallet row
    pub fn wallet_for_update(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
    ) -> Result<Option<WalletRecord>> {
        let cf = self.storage.cf_handle(CF_WALLETS)?;
        self.txn
            .get_for_update_cf(cf, wallet_key(user_id, currency), true)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Lock and read a streak row
    pub fn streak_for_update(&self, user_id: &UserId) -> Result<Option<StreakState>> {
        let cf = self.storage.cf_handle(CF_STREAKS)?;
        self.txn
            .get_for_update_cf(cf, user_key(user_id), true)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Append entry with wallet update and indices (atomic on commit).
    ///
    /// The idempotency index is the uniqueness constraint: a key that is
    /// already present yields [`Error::DuplicateTransaction`].
    pub(crate) fn append_entry_atomic(&self, entry: &LedgerEntry, wallet: &WalletRecord) -> Result<()> {
        if entry.user_id != wallet.user_id
            || entry.currency != wallet.currency
            || entry.balance_after != wallet.balance
            || entry.sequence != wallet.sequence
        {
            return Err(Error::InvariantViolation(format!(
                "Entry {} does not match wallet {}/{}",
                entry.id, wallet.user_id, wallet.currency
            )));
        }

        // 1. Uniqueness on idempotency key
        let cf_idempotency = self.storage.cf_handle(CF_IDEMPOTENCY)?;
        if self
            .txn
            .get_for_update_cf(cf_idempotency, entry.idempotency_key.as_bytes(), true)?
            .is_some()
        {
            return Err(Error::DuplicateTransaction(entry.idempotency_key.clone()));
        }
        self.txn
            .put_cf(cf_idempotency, entry.idempotency_key.as_bytes(), entry.id.as_bytes())?;

        // 2. Entry
        let cf_entries = self.storage.cf_handle(CF_ENTRIES)?;
        self.txn.put_cf(cf_entries, entry.id.as_bytes(), bincode::serialize(entry)?)?;

        // 3. Wallet
        let cf_wallets = self.storage.cf_handle(CF_WALLETS)?;
        self.txn.put_cf(
            cf_wallets,
            wallet_key(&wallet.user_id, wallet.currency),
            bincode::serialize(wallet)?,
        )?;

        // 4. Indices
        let cf_user = self.storage.cf_handle(CF_USER_ENTRIES)?;
        self.txn
            .put_cf(cf_user, user_entry_key(&entry.user_id, HistoryPosition::of(entry)), b"")?;

        let cf_chain = self.storage.cf_handle(CF_WALLET_ENTRIES)?;
        let mut chain_key = wallet_key(&entry.user_id, entry.currency);
        chain_key.extend_from_slice(&entry.sequence.to_be_bytes());
        self.txn.put_cf(cf_chain, chain_key, entry.id.as_bytes())?;

        Ok(())
    }

    /// Write a streak row
    pub(crate) fn put_streak(&self, state: &StreakState) -> Result<()> {
        let cf = self.storage.cf_handle(CF_STREAKS)?;
        self.txn
            .put_cf(cf, user_key(&state.user_id), bincode::serialize(state)?)?;
        Ok(())
    }

    /// Commit all writes atomically
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

// Key helpers

fn user_key(user_id: &UserId) -> Vec<u8> {
    let id = user_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(2 + id.len() + 25);
    key.extend_from_slice(&(id.len() as u16).to_be_bytes());
    key.extend_from_slice(id);
    key
}

fn wallet_key(user_id: &UserId, currency: CurrencyType) -> Vec<u8> {
    let mut key = user_key(user_id);
    key.push(currency as u8);
    key
}

fn user_entry_key(user_id: &UserId, position: HistoryPosition) -> Vec<u8> {
    let mut key = user_key(user_id);
    key.extend_from_slice(&(position.created_at_nanos as u64).to_be_bytes());
    key.extend_from_slice(position.entry_id.as_bytes());
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_uuid(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("Corrupt entry id: {}", e)))
}
