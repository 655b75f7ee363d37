//! Rewards engine: one store, one metrics registry, three components

use crate::{
    metrics::Metrics,
    types::{
        ChainAudit, CurrencyType, LedgerEntry, LedgerFilter, LedgerPage, LevelInfo, StreakState,
        StreakUpdate, TransactionRequest, UserId, WalletSnapshot,
    },
    Config, Error, Ledger, Result, Storage, StreakTracker, Wallet,
};
use chrono::NaiveDate;
use std::sync::Arc;

/// Entry point wiring the ledger, wallet and streak tracker to one store
#[derive(Debug, Clone)]
pub struct RewardsEngine {
    config: Arc<Config>,
    ledger: Ledger,
    wallet: Wallet,
    streaks: StreakTracker,
}

impl RewardsEngine {
    /// Open the store at `config.data_dir` and build the components
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            "Opening rewards engine"
        );

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let ledger = Ledger::new(storage, &config, metrics);
        let wallet = Wallet::new(ledger.clone(), config.levels.clone());
        let streaks = StreakTracker::new(ledger.clone(), config.streak.clone());

        Ok(Self {
            config: Arc::new(config),
            ledger,
            wallet,
            streaks,
        })
    }

    /// Record a balance change (idempotent on the request key)
    pub async fn record_transaction(&self, request: TransactionRequest) -> Result<LedgerEntry> {
        self.ledger.record_transaction(request).await
    }

    /// All balances for a user
    pub async fn get_wallet(&self, user_id: &UserId) -> Result<WalletSnapshot> {
        self.wallet.get_wallet(user_id).await
    }

    /// A user's ledger, newest first
    pub async fn get_user_ledger(&self, user_id: &UserId, filter: LedgerFilter) -> Result<LedgerPage> {
        self.ledger.get_user_ledger(user_id, filter).await
    }

    /// Record a qualifying activity
    pub async fn update_streak(&self, user_id: &UserId, activity_date: NaiveDate) -> Result<StreakUpdate> {
        self.streaks.update_streak(user_id, activity_date).await
    }

    /// Current streak state
    pub async fn get_streak(&self, user_id: &UserId) -> Result<StreakState> {
        self.streaks.get_streak(user_id).await
    }

    /// Level from XP
    pub async fn get_level(&self, user_id: &UserId) -> Result<LevelInfo> {
        self.wallet.get_level(user_id).await
    }

    /// Audit one wallet's hash chain
    pub async fn verify_chain(&self, user_id: &UserId, currency: CurrencyType) -> Result<ChainAudit> {
        self.ledger.verify_chain(user_id, currency).await
    }

    /// Ledger component
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Wallet component
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    /// Streak component
    pub fn streaks(&self) -> &StreakTracker {
        &self.streaks
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        self.ledger.metrics()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
