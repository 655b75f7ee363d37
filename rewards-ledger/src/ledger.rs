//! Append-only ledger
//!
//! Every balance change is one call to [`apply_transaction`] inside a store
//! transaction: replay on a known idempotency key, otherwise lock the wallet,
//! validate, append the entry and write the new wallet row together.
//!
//! # Example
//!
//! ```no_run
//! use rewards_ledger::{Config, CurrencyType, Reason, RewardsEngine, TransactionRequest, TransactionType, UserId};
//!
//! #[tokio::main]
//! async fn main() -> rewards_ledger::Result<()> {
//!     let engine = RewardsEngine::open(Config::default())?;
//!
//!     let entry = engine
//!         .record_transaction(TransactionRequest::new(
//!             UserId::new("user-42"),
//!             CurrencyType::Xp,
//!             100,
//!             Reason::QuizCompleted,
//!             "quiz-7f3a",
//!             TransactionType::Earn,
//!         ))
//!         .await?;
//!     assert_eq!(entry.balance_after, 100);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    config::{QueryConfig, TransactionConfig},
    metrics::Metrics,
    storage::{HistoryPosition, StoreTxn},
    types::{
        ChainAudit, CurrencyType, LedgerEntry, LedgerFilter, LedgerPage, TransactionRequest,
        UserId, WalletRecord, ZERO_HASH,
    },
    Config, Error, Result, Storage,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Outcome of applying a request inside a store transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// New entry appended
    Recorded(LedgerEntry),
    /// Idempotency key already committed; existing entry returned
    Replayed(LedgerEntry),
}

impl Applied {
    /// Entry, new or replayed
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Applied::Recorded(entry) | Applied::Replayed(entry) => entry,
        }
    }

    /// Take the entry
    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Applied::Recorded(entry) | Applied::Replayed(entry) => entry,
        }
    }

    /// Whether this call appended the entry
    pub fn is_new(&self) -> bool {
        matches!(self, Applied::Recorded(_))
    }
}

/// Record one balance change inside `txn`.
///
/// Nothing is written on error; the caller commits or drops `txn`.
pub(crate) fn apply_transaction(txn: &StoreTxn<'_>, request: &TransactionRequest) -> Result<Applied> {
    request.validate()?;

    // 1. Idempotent replay
    if let Some(existing) = txn.entry_for_key(&request.idempotency_key)? {
        if !existing.matches(request) {
            tracing::warn!(
                idempotency_key = %request.idempotency_key,
                entry_id = %existing.id,
                requested_amount = request.amount,
                recorded_amount = existing.amount,
                "Idempotency key reused with a different payload, returning recorded entry"
            );
        }
        tracing::debug!(
            idempotency_key = %request.idempotency_key,
            entry_id = %existing.id,
            "Idempotent replay"
        );
        return Ok(Applied::Replayed(existing));
    }

    // 2. Current balance, locked until commit
    let locked = txn.wallet_for_update(&request.user_id, request.currency)?;
    let created_at = txn.now();
    let wallet = locked.unwrap_or_else(|| {
        WalletRecord::empty(request.user_id.clone(), request.currency, created_at)
    });

    // 3. Validate
    let balance_after = wallet
        .balance
        .checked_add(request.amount)
        .ok_or_else(|| Error::InvalidAmount(format!("Balance overflow adding {}", request.amount)))?;

    if balance_after < 0 {
        return Err(Error::InsufficientBalance {
            user_id: request.user_id.clone(),
            currency: request.currency,
            balance: wallet.balance,
            requested: request.amount,
        });
    }

    // 4. Entry and wallet, written together
    let mut entry = LedgerEntry {
        id: Uuid::now_v7(),
        user_id: request.user_id.clone(),
        currency: request.currency,
        amount: request.amount,
        reason: request.reason,
        idempotency_key: request.idempotency_key.clone(),
        balance_before: wallet.balance,
        balance_after,
        transaction_type: request.transaction_type,
        created_at,
        sequence: wallet.sequence + 1,
        previous_hash: wallet.head_hash,
        entry_hash: ZERO_HASH,
        metadata: request.metadata.clone(),
    };
    entry.entry_hash = entry.compute_hash();

    let updated = WalletRecord {
        balance: balance_after,
        sequence: entry.sequence,
        head_hash: entry.entry_hash,
        updated_at: created_at,
        ..wallet
    };

    txn.append_entry_atomic(&entry, &updated)?;

    Ok(Applied::Recorded(entry))
}

/// Replay a wallet's chain and compare it with the wallet row
pub fn audit_chain(
    user_id: &UserId,
    currency: CurrencyType,
    entries: &[LedgerEntry],
    wallet: Option<&WalletRecord>,
) -> Result<ChainAudit> {
    let violation = |msg: String| Error::InvariantViolation(format!("{}/{}: {}", user_id, currency, msg));

    let mut balance = 0i64;
    let mut head = ZERO_HASH;
    let mut total: i128 = 0;

    for (index, entry) in entries.iter().enumerate() {
        let expected = index as u64 + 1;
        if entry.sequence != expected {
            return Err(violation(format!("expected sequence {}, found {}", expected, entry.sequence)));
        }
        if entry.user_id != *user_id || entry.currency != currency {
            return Err(violation(format!("entry {} belongs to another wallet", entry.id)));
        }
        if entry.balance_before != balance {
            return Err(violation(format!(
                "entry {} starts at {}, previous balance {}",
                entry.id, entry.balance_before, balance
            )));
        }
        if !entry.is_balanced() || entry.balance_after < 0 {
            return Err(violation(format!("entry {} is not balanced", entry.id)));
        }
        if entry.previous_hash != head {
            return Err(violation(format!("entry {} breaks the hash chain", entry.id)));
        }
        if entry.compute_hash() != entry.entry_hash {
            return Err(violation(format!("entry {} hash mismatch", entry.id)));
        }

        balance = entry.balance_after;
        head = entry.entry_hash;
        total += i128::from(entry.amount);
    }

    if total != i128::from(balance) {
        return Err(violation(format!("sum of amounts {} != balance {}", total, balance)));
    }

    match wallet {
        Some(wallet) => {
            if wallet.balance != balance
                || wallet.sequence != entries.len() as u64
                || wallet.head_hash != head
            {
                return Err(violation(format!(
                    "wallet row (balance {}, sequence {}) disagrees with replay (balance {}, sequence {})",
                    wallet.balance,
                    wallet.sequence,
                    balance,
                    entries.len()
                )));
            }
        }
        None if !entries.is_empty() => {
            return Err(violation("entries exist without a wallet row".to_string()));
        }
        None => {}
    }

    Ok(ChainAudit {
        user_id: user_id.clone(),
        currency,
        entries: entries.len() as u64,
        balance,
        head_hash: head,
    })
}

/// Ledger handle (cheap to clone)
#[derive(Debug, Clone)]
pub struct Ledger {
    storage: Arc<Storage>,
    transactions: TransactionConfig,
    query: QueryConfig,
    metrics: Metrics,
}

impl Ledger {
    /// Create a ledger over an opened store
    pub fn new(storage: Arc<Storage>, config: &Config, metrics: Metrics) -> Self {
        Self {
            storage,
            transactions: config.transactions.clone(),
            query: config.query.clone(),
            metrics,
        }
    }

    /// Store handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `op` in a store transaction on the blocking pool and commit it.
    ///
    /// Lock timeouts and deadlocks are retried with backoff; every other
    /// error is returned after the transaction rolls back.
    pub(crate) async fn atomic<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&StoreTxn<'_>) -> Result<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 0u32;

        loop {
            let storage = Arc::clone(&self.storage);
            let op = Arc::clone(&op);
            let started = Instant::now();

            let result = tokio::task::spawn_blocking(move || {
                let txn = storage.begin();
                let value = op(&txn)?;
                txn.commit()?;
                Ok::<T, Error>(value)
            })
            .await?;

            self.metrics
                .record_transaction_duration(started.elapsed().as_secs_f64());

            match result {
                Err(Error::TransactionConflict(reason)) if attempt < self.transactions.max_retries => {
                    attempt += 1;
                    let delay = self.transactions.backoff(attempt);
                    self.metrics.record_conflict_retry();
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Transaction conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Append a balance change, or return the entry already recorded under
    /// the same idempotency key.
    pub async fn record_transaction(&self, request: TransactionRequest) -> Result<LedgerEntry> {
        request.check_caller_key()?;

        let user_id = request.user_id.clone();
        let currency = request.currency;
        let shared = request.clone();

        match self.atomic(move |txn| apply_transaction(txn, &shared)).await {
            Ok(Applied::Recorded(entry)) => {
                self.metrics.record_entry();
                tracing::debug!(
                    user_id = %entry.user_id,
                    currency = %entry.currency,
                    entry_id = %entry.id,
                    amount = entry.amount,
                    balance_after = entry.balance_after,
                    reason = %entry.reason,
                    "Entry appended"
                );
                Ok(entry)
            }
            Ok(Applied::Replayed(entry)) => {
                self.metrics.record_replay();
                Ok(entry)
            }
            // Lost a race on the uniqueness index: return the winner's entry
            Err(Error::DuplicateTransaction(key)) => {
                self.metrics.record_replay();
                self.get_entry_by_key(&key).await?.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "Idempotency key {} collided but no entry is committed",
                        key
                    ))
                })
            }
            Err(err @ Error::InsufficientBalance { .. }) => {
                self.metrics.record_insufficient_balance();
                tracing::debug!(
                    user_id = %user_id,
                    currency = %currency,
                    idempotency_key = %request.idempotency_key,
                    "Debit rejected: insufficient balance"
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Committed entry for an idempotency key
    pub async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let storage = Arc::clone(&self.storage);
        let key = idempotency_key.to_string();
        tokio::task::spawn_blocking(move || storage.find_entry_by_key(&key)).await?
    }

    /// Committed wallet row
    pub async fn get_wallet_record(
        &self,
        user_id: &UserId,
        currency: CurrencyType,
    ) -> Result<Option<WalletRecord>> {
        let storage = Arc::clone(&self.storage);
        let user_id = user_id.clone();
        tokio::task::spawn_blocking(move || storage.get_wallet(&user_id, currency)).await?
    }

    /// A user's entries, newest first, one page at a time
    pub async fn get_user_ledger(&self, user_id: &UserId, filter: LedgerFilter) -> Result<LedgerPage> {
        user_id.validate()?;

        let limit = self.query.page_size(filter.limit);
        let before = filter
            .cursor
            .as_deref()
            .map(HistoryPosition::from_cursor)
            .transpose()?;

        let storage = Arc::clone(&self.storage);
        let user_id = user_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::with_capacity(limit);
            let mut has_more = false;

            storage.scan_user_entries(&user_id, before, |entry| {
                // Newest first: once past the lower bound nothing else matches
                if filter.date_range.from.map_or(false, |from| entry.created_at < from) {
                    return Ok(ControlFlow::Break(()));
                }
                if !filter.date_range.contains(entry.created_at)
                    || filter.currency.map_or(false, |c| c != entry.currency)
                    || filter.reason.map_or(false, |r| r != entry.reason)
                {
                    return Ok(ControlFlow::Continue(()));
                }
                if entries.len() == limit {
                    has_more = true;
                    return Ok(ControlFlow::Break(()));
                }
                entries.push(entry);
                Ok(ControlFlow::Continue(()))
            })?;

            let next_cursor = if has_more {
                entries.last().map(|entry| HistoryPosition::of(entry).to_cursor())
            } else {
                None
            };

            Ok::<_, Error>(LedgerPage { entries, next_cursor })
        })
        .await?
    }

    /// Replay one wallet's chain and check it against the wallet row
    pub async fn verify_chain(&self, user_id: &UserId, currency: CurrencyType) -> Result<ChainAudit> {
        let storage = Arc::clone(&self.storage);
        let user_id = user_id.clone();

        tokio::task::spawn_blocking(move || {
            // Wallet first: entries committed after this read are ignored
            let wallet = storage.get_wallet(&user_id, currency)?;
            let mut entries = storage.wallet_entries(&user_id, currency)?;
            let committed = wallet.as_ref().map_or(0, |w| w.sequence) as usize;
            entries.truncate(committed);

            let audit = audit_chain(&user_id, currency, &entries, wallet.as_ref());
            if let Err(ref err) = audit {
                tracing::error!(user_id = %user_id, currency = %currency, error = %err, "Ledger chain audit failed");
            }
            audit
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DateRange, Reason, TransactionType};
    use tempfile::TempDir;

    fn create_test_ledger() -> (Ledger, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        (Ledger::new(storage, &config, Metrics::new().unwrap()), temp_dir)
    }

    fn earn(user: &str, currency: CurrencyType, amount: i64, key: &str) -> TransactionRequest {
        TransactionRequest::new(
            UserId::new(user),
            currency,
            amount,
            Reason::QuizCompleted,
            key,
            TransactionType::Earn,
        )
    }

    fn spend(user: &str, currency: CurrencyType, amount: i64, key: &str) -> TransactionRequest {
        TransactionRequest::new(
            UserId::new(user),
            currency,
            -amount,
            Reason::ShieldConsumed,
            key,
            TransactionType::Spend,
        )
    }

    #[tokio::test]
    async fn test_credit_is_idempotent() {
        let (ledger, _temp) = create_test_ledger();

        let first = ledger
            .record_transaction(earn("user-1", CurrencyType::Xp, 100, "quiz-1"))
            .await
            .unwrap();
        assert_eq!(first.balance_before, 0);
        assert_eq!(first.balance_after, 100);

        let second = ledger
            .record_transaction(earn("user-1", CurrencyType::Xp, 100, "quiz-1"))
            .await
            .unwrap();
        assert_eq!(second, first);

        let wallet = ledger
            .get_wallet_record(&UserId::new("user-1"), CurrencyType::Xp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wallet.balance, 100);
        assert_eq!(wallet.sequence, 1);
        assert_eq!(ledger.metrics().replays_total.get(), 1);
    }

    #[tokio::test]
    async fn test_debit_below_zero_rejected() {
        let (ledger, _temp) = create_test_ledger();
        let user = UserId::new("user-1");

        ledger
            .record_transaction(earn("user-1", CurrencyType::Shields, 1, "grant-1"))
            .await
            .unwrap();
        let spent = ledger
            .record_transaction(spend("user-1", CurrencyType::Shields, 1, "use-1"))
            .await
            .unwrap();
        assert_eq!(spent.balance_after, 0);

        let err = ledger
            .record_transaction(spend("user-1", CurrencyType::Shields, 1, "use-2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientBalance { balance: 0, requested: -1, .. }
        ));

        let wallet = ledger
            .get_wallet_record(&user, CurrencyType::Shields)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wallet.balance, 0);
        assert!(ledger.get_entry_by_key("use-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (ledger, _temp) = create_test_ledger();

        let result = ledger
            .record_transaction(earn("user-1", CurrencyType::Xp, 0, "zero"))
            .await;
        assert!(matches!(result, Err(Error::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_streak_keys_rejected_from_callers() {
        let (ledger, _temp) = create_test_ledger();

        let err = ledger
            .record_transaction(earn("user-1", CurrencyType::Xp, 5, "streak-milestone/user-2/7"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(ledger
            .get_entry_by_key("streak-milestone/user-2/7")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_replay_with_different_payload_returns_original() {
        let (ledger, _temp) = create_test_ledger();

        let original = ledger
            .record_transaction(earn("user-1", CurrencyType::Coins, 10, "referral-9"))
            .await
            .unwrap();
        let replay = ledger
            .record_transaction(earn("user-1", CurrencyType::Coins, 999, "referral-9"))
            .await
            .unwrap();

        assert_eq!(replay.id, original.id);
        assert_eq!(replay.amount, 10);
    }

    #[tokio::test]
    async fn test_idempotency_key_is_global() {
        let (ledger, _temp) = create_test_ledger();

        let original = ledger
            .record_transaction(earn("user-1", CurrencyType::Xp, 10, "event-1"))
            .await
            .unwrap();
        let other_currency = ledger
            .record_transaction(earn("user-1", CurrencyType::Coins, 10, "event-1"))
            .await
            .unwrap();

        assert_eq!(other_currency.id, original.id);
        assert!(ledger
            .get_wallet_record(&UserId::new("user-1"), CurrencyType::Coins)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_single_winner() {
        let (ledger, _temp) = create_test_ledger();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .record_transaction(earn("user-1", CurrencyType::Xp, 25, "quiz-race"))
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let audit = ledger
            .verify_chain(&UserId::new("user-1"), CurrencyType::Xp)
            .await
            .unwrap();
        assert_eq!(audit.entries, 1);
        assert_eq!(audit.balance, 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_credits_conserve_balance() {
        let (ledger, _temp) = create_test_ledger();

        let mut handles = Vec::new();
        for i in 0..40 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .record_transaction(earn("user-1", CurrencyType::Coins, 10, &format!("c-{}", i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let audit = ledger
            .verify_chain(&UserId::new("user-1"), CurrencyType::Coins)
            .await
            .unwrap();
        assert_eq!(audit.entries, 40);
        assert_eq!(audit.balance, 400);
    }

    #[tokio::test]
    async fn test_user_ledger_pagination() {
        let (ledger, _temp) = create_test_ledger();

        for i in 0..25 {
            ledger
                .record_transaction(earn("user-1", CurrencyType::Xp, 1, &format!("q-{}", i)))
                .await
                .unwrap();
        }
        ledger
            .record_transaction(earn("user-2", CurrencyType::Xp, 1, "other"))
            .await
            .unwrap();

        let user = UserId::new("user-1");
        let mut seen = Vec::new();
        let mut cursor = None;
        let mut pages = 0;
        loop {
            let page = ledger
                .get_user_ledger(
                    &user,
                    LedgerFilter {
                        cursor: cursor.clone(),
                        limit: Some(10),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            pages += 1;
            seen.extend(page.entries.into_iter().map(|e| e.idempotency_key));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(pages, 3);
        let expected: Vec<String> = (0..25).rev().map(|i| format!("q-{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_user_ledger_filters() {
        let (ledger, _temp) = create_test_ledger();

        ledger
            .record_transaction(earn("user-1", CurrencyType::Xp, 10, "xp-1"))
            .await
            .unwrap();
        ledger
            .record_transaction(earn("user-1", CurrencyType::Shields, 2, "shield-1"))
            .await
            .unwrap();
        let cutoff = chrono::Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger
            .record_transaction(spend("user-1", CurrencyType::Shields, 1, "shield-2"))
            .await
            .unwrap();

        let user = UserId::new("user-1");

        let shields = ledger
            .get_user_ledger(
                &user,
                LedgerFilter {
                    currency: Some(CurrencyType::Shields),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(shields.entries.len(), 2);
        assert_eq!(shields.entries[0].idempotency_key, "shield-2");

        let consumed = ledger
            .get_user_ledger(
                &user,
                LedgerFilter {
                    reason: Some(Reason::ShieldConsumed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(consumed.entries.len(), 1);

        let before_cutoff = ledger
            .get_user_ledger(
                &user,
                LedgerFilter {
                    date_range: DateRange { from: None, to: Some(cutoff) },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(before_cutoff.entries.len(), 2);
        assert!(before_cutoff.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_invalid_cursor_rejected() {
        let (ledger, _temp) = create_test_ledger();

        let result = ledger
            .get_user_ledger(
                &UserId::new("user-1"),
                LedgerFilter {
                    cursor: Some("zz".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_verify_chain_empty_wallet() {
        let (ledger, _temp) = create_test_ledger();

        let audit = ledger
            .verify_chain(&UserId::new("nobody"), CurrencyType::Coins)
            .await
            .unwrap();
        assert_eq!(audit.entries, 0);
        assert_eq!(audit.balance, 0);
        assert_eq!(audit.head_hash, ZERO_HASH);
    }

    #[tokio::test]
    async fn test_audit_detects_tampering() {
        let (ledger, _temp) = create_test_ledger();
        let user = UserId::new("user-1");

        for i in 0..3 {
            ledger
                .record_transaction(earn("user-1", CurrencyType::Xp, 5, &format!("t-{}", i)))
                .await
                .unwrap();
        }

        let mut entries = ledger.storage().wallet_entries(&user, CurrencyType::Xp).unwrap();
        let wallet = ledger.storage().get_wallet(&user, CurrencyType::Xp).unwrap();
        assert!(audit_chain(&user, CurrencyType::Xp, &entries, wallet.as_ref()).is_ok());

        entries[1].amount = 6;
        entries[1].balance_after = 11;
        let err = audit_chain(&user, CurrencyType::Xp, &entries, wallet.as_ref()).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
