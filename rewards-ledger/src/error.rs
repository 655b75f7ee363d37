//! Error types for the rewards ledger

use crate::types::{CurrencyType, UserId};
use rocksdb::ErrorKind;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Debit would drive the wallet below zero
    #[error("Insufficient {currency} balance for {user_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        /// Wallet owner
        user_id: UserId,
        /// Wallet currency
        currency: CurrencyType,
        /// Balance at the time of the request
        balance: i64,
        /// Signed amount that was rejected
        requested: i64,
    },

    /// Idempotency key already committed. Resolved to a replay inside the
    /// ledger and never returned from its public API.
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    /// Zero, overflowing or wrongly signed amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed request (empty user id, oversized idempotency key, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Store could not serve the request; safe to retry with the same key
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Lock timeout or deadlock between concurrent transactions
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Streak bookkeeping regressed (date moved backward, counters inconsistent)
    #[error("Streak consistency error: {0}")]
    StreakConsistency(String),

    /// Invariant violation (conservation, chain linkage, ...)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Blocking task failed or was cancelled
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient infrastructure failure; the caller may retry with the same
    /// idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::TransactionConflict(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
                Error::TransactionConflict(err.to_string())
            }
            ErrorKind::IOError
            | ErrorKind::Incomplete
            | ErrorKind::ShutdownInProgress
            | ErrorKind::Aborted => Error::StoreUnavailable(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Concurrency(format!("Blocking task failed: {}", err))
    }
}
