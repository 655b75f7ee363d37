//! Wallet: per-user balances over the ledger
//!
//! Balances are read from the wallet rows the ledger maintains. Every
//! mutation here is a validated [`TransactionRequest`] handed to
//! [`Ledger::record_transaction`]; the wallet never writes a row itself.

use crate::{
    config::LevelConfig,
    types::{
        CurrencyType, LedgerEntry, LevelInfo, Metadata, Reason, TransactionRequest,
        TransactionType, UserId, WalletSnapshot,
    },
    Error, Ledger, Result,
};
use std::sync::Arc;

/// Wallet handle (cheap to clone)
#[derive(Debug, Clone)]
pub struct Wallet {
    ledger: Ledger,
    levels: LevelConfig,
}

impl Wallet {
    /// Create a wallet view over `ledger`
    pub fn new(ledger: Ledger, levels: LevelConfig) -> Self {
        Self { ledger, levels }
    }

    /// All three balances; currencies never transacted read as zero
    pub async fn get_wallet(&self, user_id: &UserId) -> Result<WalletSnapshot> {
        user_id.validate()?;

        let storage = Arc::clone(self.ledger.storage());
        let user_id = user_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut snapshot = WalletSnapshot::default();
            for currency in CurrencyType::ALL {
                if let Some(record) = storage.get_wallet(&user_id, currency)? {
                    snapshot.set(currency, record.balance);
                }
            }
            Ok::<_, Error>(snapshot)
        })
        .await?
    }

    /// Balance of one currency
    pub async fn get_balance(&self, user_id: &UserId, currency: CurrencyType) -> Result<i64> {
        user_id.validate()?;
        Ok(self
            .ledger
            .get_wallet_record(user_id, currency)
            .await?
            .map_or(0, |record| record.balance))
    }

    /// Add `amount` (> 0) as an EARN entry
    pub async fn credit(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
        amount: i64,
        reason: Reason,
        idempotency_key: &str,
    ) -> Result<LedgerEntry> {
        self.credit_with_metadata(user_id, currency, amount, reason, idempotency_key, None)
            .await
    }

    /// [`Wallet::credit`] with descriptive metadata
    pub async fn credit_with_metadata(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
        amount: i64,
        reason: Reason,
        idempotency_key: &str,
        metadata: Option<Metadata>,
    ) -> Result<LedgerEntry> {
        let amount = positive(amount)?;
        self.submit(user_id, currency, amount, reason, idempotency_key, TransactionType::Earn, metadata)
            .await
    }

    /// Remove `amount` (> 0) as a SPEND entry
    pub async fn debit(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
        amount: i64,
        reason: Reason,
        idempotency_key: &str,
    ) -> Result<LedgerEntry> {
        self.debit_with_metadata(user_id, currency, amount, reason, idempotency_key, None)
            .await
    }

    /// [`Wallet::debit`] with descriptive metadata
    pub async fn debit_with_metadata(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
        amount: i64,
        reason: Reason,
        idempotency_key: &str,
        metadata: Option<Metadata>,
    ) -> Result<LedgerEntry> {
        let amount = positive(amount)?;
        self.submit(user_id, currency, -amount, reason, idempotency_key, TransactionType::Spend, metadata)
            .await
    }

    /// Give back `amount` (> 0) as a REFUND entry
    pub async fn refund(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<LedgerEntry> {
        let amount = positive(amount)?;
        self.submit(
            user_id,
            currency,
            amount,
            Reason::Refund,
            idempotency_key,
            TransactionType::Refund,
            None,
        )
        .await
    }

    /// Tier derived from the current XP balance
    pub async fn get_level(&self, user_id: &UserId) -> Result<LevelInfo> {
        let xp = self.get_balance(user_id, CurrencyType::Xp).await?;
        Ok(self.levels.level_for(xp))
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
        amount: i64,
        reason: Reason,
        idempotency_key: &str,
        transaction_type: TransactionType,
        metadata: Option<Metadata>,
    ) -> Result<LedgerEntry> {
        let mut request = TransactionRequest::new(
            user_id.clone(),
            currency,
            amount,
            reason,
            idempotency_key,
            transaction_type,
        );
        request.metadata = metadata;
        request.check_caller_key()?;

        self.ledger.record_transaction(request).await
    }
}

fn positive(amount: i64) -> Result<i64> {
    if amount <= 0 {
        return Err(Error::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    Ok(amount)
}
