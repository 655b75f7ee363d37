//! Rewards Ledger
//!
//! Append-only ledger, wallets and daily streaks for a gamified learning
//! platform. Three currencies: XP, COINS and SHIELDS.
//!
//! # Architecture
//!
//! - **Ledger**: Every balance change is an immutable entry keyed by an idempotency key
//! - **Wallets**: Balance rows updated in the same store transaction as their entry
//! - **Streaks**: Shields cover missed days; milestones pay out once per threshold
//! - **Store**: RocksDB pessimistic transactions with row locks per wallet and key
//!
//! # Invariants
//!
//! - Conservation: a wallet's balance equals the sum of its entry amounts
//! - Non-negative: no committed balance is below zero
//! - Idempotent: one committed entry per idempotency key
//! - Chained: each wallet's entries form a SHA-256 hash chain

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod ledger;
pub mod wallet;
pub mod streak;
pub mod engine;
pub mod http;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    ChainAudit, CurrencyType, DateRange, LedgerEntry, LedgerFilter, LedgerPage, LevelInfo,
    LevelTier, Metadata, MilestoneReward, Reason, StreakOutcome, StreakState, StreakUpdate,
    TransactionRequest, TransactionType, UserId, WalletSnapshot,
};
pub use storage::Storage;
pub use ledger::Ledger;
pub use wallet::Wallet;
pub use streak::StreakTracker;
pub use engine::RewardsEngine;
pub use metrics::Metrics;
pub use config::Config;
