//! Core types for the rewards ledger
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode)
//! - Integer arithmetic (balances are whole units of a virtual currency)
//! - Append-only history (entries are never rewritten)

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Genesis marker for a wallet's hash chain
pub const ZERO_HASH: [u8; 32] = [0u8; 32];

/// Upper bound for user ids and idempotency keys (bytes)
pub const MAX_KEY_LEN: usize = 256;

/// Idempotency keys with this prefix are issued by the streak tracker only
pub const RESERVED_KEY_PREFIX: &str = "streak-";

/// Stable user identifier supplied by the identity collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate length constraints
    pub fn validate(&self) -> crate::Result<()> {
        if self.0.is_empty() {
            return Err(crate::Error::InvalidRequest("user id is empty".to_string()));
        }
        if self.0.len() > MAX_KEY_LEN {
            return Err(crate::Error::InvalidRequest(format!(
                "user id exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual currency held in a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CurrencyType {
    /// Experience points
    Xp = 1,
    /// Spendable coins
    Coins = 2,
    /// Streak shields
    Shields = 3,
}

impl CurrencyType {
    /// All currencies, in wallet display order
    pub const ALL: [CurrencyType; 3] = [CurrencyType::Xp, CurrencyType::Coins, CurrencyType::Shields];

    /// Canonical code
    pub fn code(&self) -> &'static str {
        match self {
            CurrencyType::Xp => "XP",
            CurrencyType::Coins => "COINS",
            CurrencyType::Shields => "SHIELDS",
        }
    }

    /// Parse from string
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "XP" => Some(CurrencyType::Xp),
            "COINS" => Some(CurrencyType::Coins),
            "SHIELDS" => Some(CurrencyType::Shields),
            _ => None,
        }
    }
}

impl fmt::Display for CurrencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Semantic tag for a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Quiz finished
    QuizCompleted,
    /// Streak crossed a milestone threshold
    StreakMilestone,
    /// Referred user confirmed
    ReferralBonus,
    /// Shield spent to cover a missed day
    ShieldConsumed,
    /// Shield bought with coins
    ShieldPurchased,
    /// Daily login bonus
    DailyBonus,
    /// Achievement unlocked
    AchievementUnlocked,
    /// Manual correction by an operator
    AdminAdjustment,
    /// Reversal of an earlier spend
    Refund,
}

impl Reason {
    /// Canonical code
    pub fn code(&self) -> &'static str {
        match self {
            Reason::QuizCompleted => "QUIZ_COMPLETED",
            Reason::StreakMilestone => "STREAK_MILESTONE",
            Reason::ReferralBonus => "REFERRAL_BONUS",
            Reason::ShieldConsumed => "SHIELD_CONSUMED",
            Reason::ShieldPurchased => "SHIELD_PURCHASED",
            Reason::DailyBonus => "DAILY_BONUS",
            Reason::AchievementUnlocked => "ACHIEVEMENT_UNLOCKED",
            Reason::AdminAdjustment => "ADMIN_ADJUSTMENT",
            Reason::Refund => "REFUND",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Accounting class of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TransactionType {
    /// Credit earned by activity
    Earn = 1,
    /// Debit spent by the user or the system
    Spend = 2,
    /// Operator correction, either sign
    Adjustment = 3,
    /// Credit reversing a spend
    Refund = 4,
}

impl TransactionType {
    /// Check that `amount` carries the sign this type requires
    pub fn permits(&self, amount: i64) -> bool {
        match self {
            TransactionType::Earn | TransactionType::Refund => amount > 0,
            TransactionType::Spend => amount < 0,
            TransactionType::Adjustment => amount != 0,
        }
    }
}

/// Descriptive, never authoritative, entry metadata
pub type Metadata = BTreeMap<String, String>;

/// Request to append one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    /// Wallet owner
    pub user_id: UserId,
    /// Wallet currency
    pub currency: CurrencyType,
    /// Signed amount (positive credit, negative debit)
    pub amount: i64,
    /// Semantic reason
    pub reason: Reason,
    /// Caller-supplied key, unique per logical source event
    pub idempotency_key: String,
    /// Accounting class
    pub transaction_type: TransactionType,
    /// Optional descriptive metadata
    pub metadata: Option<Metadata>,
}

impl TransactionRequest {
    /// Create a request without metadata
    pub fn new(
        user_id: UserId,
        currency: CurrencyType,
        amount: i64,
        reason: Reason,
        idempotency_key: impl Into<String>,
        transaction_type: TransactionType,
    ) -> Self {
        Self {
            user_id,
            currency,
            amount,
            reason,
            idempotency_key: idempotency_key.into(),
            transaction_type,
            metadata: None,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate shape before touching the store
    pub fn validate(&self) -> crate::Result<()> {
        self.user_id.validate()?;

        if self.idempotency_key.is_empty() {
            return Err(crate::Error::InvalidRequest(
                "idempotency key is empty".to_string(),
            ));
        }
        if self.idempotency_key.len() > MAX_KEY_LEN {
            return Err(crate::Error::InvalidRequest(format!(
                "idempotency key exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }

        if self.amount == 0 {
            return Err(crate::Error::InvalidAmount("Amount must be non-zero".to_string()));
        }
        if self.amount == i64::MIN {
            return Err(crate::Error::InvalidAmount("Amount out of range".to_string()));
        }
        if !self.transaction_type.permits(self.amount) {
            return Err(crate::Error::InvalidAmount(format!(
                "Amount {} has the wrong sign for {:?}",
                self.amount, self.transaction_type
            )));
        }

        Ok(())
    }

    /// Reject keys from the reserved streak namespace
    pub fn check_caller_key(&self) -> crate::Result<()> {
        if self.idempotency_key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(crate::Error::InvalidRequest(format!(
                "idempotency key {} uses the reserved prefix {}",
                self.idempotency_key, RESERVED_KEY_PREFIX
            )));
        }
        Ok(())
    }
}

/// Immutable journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Wallet owner
    pub user_id: UserId,

    /// Wallet currency
    pub currency: CurrencyType,

    /// Signed amount
    pub amount: i64,

    /// Semantic reason
    pub reason: Reason,

    /// Idempotency key (unique system-wide)
    pub idempotency_key: String,

    /// Wallet balance before this entry
    pub balance_before: i64,

    /// Wallet balance after this entry
    pub balance_after: i64,

    /// Accounting class
    pub transaction_type: TransactionType,

    /// Commit timestamp (monotonic within the process)
    pub created_at: DateTime<Utc>,

    /// 1-based position in the wallet's chain
    pub sequence: u64,

    /// Hash of the previous entry in the wallet's chain
    pub previous_hash: [u8; 32],

    /// Hash of this entry
    pub entry_hash: [u8; 32],

    /// Additional metadata
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl LedgerEntry {
    /// Compute the chain hash over the previous hash and the entry's
    /// authoritative fields. Metadata is descriptive and excluded.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash);
        hasher.update(self.id.as_bytes());
        hasher.update((self.user_id.as_str().len() as u32).to_be_bytes());
        hasher.update(self.user_id.as_str().as_bytes());
        hasher.update([self.currency as u8, self.transaction_type as u8]);
        hasher.update(self.reason.code().as_bytes());
        hasher.update(self.amount.to_be_bytes());
        hasher.update(self.balance_before.to_be_bytes());
        hasher.update(self.balance_after.to_be_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.created_at.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        hasher.update((self.idempotency_key.len() as u32).to_be_bytes());
        hasher.update(self.idempotency_key.as_bytes());

        hasher.finalize().into()
    }

    /// Check `balance_after == balance_before + amount`
    pub fn is_balanced(&self) -> bool {
        self.balance_before.checked_add(self.amount) == Some(self.balance_after)
    }

    /// Whether `request` describes the same balance change as this entry
    pub fn matches(&self, request: &TransactionRequest) -> bool {
        self.user_id == request.user_id
            && self.currency == request.currency
            && self.amount == request.amount
            && self.reason == request.reason
            && self.transaction_type == request.transaction_type
    }
}

/// Persisted wallet row: the denormalized balance plus the chain head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    /// Wallet owner
    pub user_id: UserId,

    /// Wallet currency
    pub currency: CurrencyType,

    /// Current balance (never negative)
    pub balance: i64,

    /// Number of entries applied
    pub sequence: u64,

    /// Hash of the latest entry
    pub head_hash: [u8; 32],

    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl WalletRecord {
    /// Implicit zero-balance wallet
    pub fn empty(user_id: UserId, currency: CurrencyType, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            currency,
            balance: 0,
            sequence: 0,
            head_hash: ZERO_HASH,
            updated_at: now,
        }
    }
}

/// All three balances of one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    /// Experience points
    pub xp: i64,
    /// Coins
    pub coins: i64,
    /// Shields
    pub shields: i64,
}

impl WalletSnapshot {
    /// Balance of one currency
    pub fn balance(&self, currency: CurrencyType) -> i64 {
        match currency {
            CurrencyType::Xp => self.xp,
            CurrencyType::Coins => self.coins,
            CurrencyType::Shields => self.shields,
        }
    }

    pub(crate) fn set(&mut self, currency: CurrencyType, balance: i64) {
        match currency {
            CurrencyType::Xp => self.xp = balance,
            CurrencyType::Coins => self.coins = balance,
            CurrencyType::Shields => self.shields = balance,
        }
    }
}

/// Coarse player tier derived from XP
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelTier {
    /// Entry tier
    Bronze,
    /// Second tier
    Silver,
    /// Third tier
    Gold,
    /// Top tier
    Platinum,
}

impl LevelTier {
    /// Next tier up, if any
    pub fn next(&self) -> Option<LevelTier> {
        match self {
            LevelTier::Bronze => Some(LevelTier::Silver),
            LevelTier::Silver => Some(LevelTier::Gold),
            LevelTier::Gold => Some(LevelTier::Platinum),
            LevelTier::Platinum => None,
        }
    }
}

/// Tier computed on demand from the XP balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    /// Current tier
    pub tier: LevelTier,
    /// XP balance the tier was derived from
    pub xp: i64,
    /// Next tier, `None` at the top
    pub next_tier: Option<LevelTier>,
    /// XP still needed for the next tier
    pub xp_to_next: Option<i64>,
}

/// Per-user streak bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    /// Owner
    pub user_id: UserId,

    /// Consecutive active days ending at `last_activity_date`
    pub current_streak_days: u32,

    /// Best streak ever reached
    pub longest_streak_days: u32,

    /// Calendar day of the last qualifying activity
    pub last_activity_date: Option<NaiveDate>,

    /// SHIELDS wallet balance at read time (not persisted)
    #[serde(skip)]
    pub shields_available: i64,

    /// Shields spent on this streak's gaps, all time
    pub shields_used_to_date: u64,

    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl StreakState {
    /// State of a user with no recorded activity
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            current_streak_days: 0,
            longest_streak_days: 0,
            last_activity_date: None,
            shields_available: 0,
            shields_used_to_date: 0,
            updated_at: now,
        }
    }
}

/// How an activity moved the streak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreakOutcome {
    /// First ever activity
    Started,
    /// Activity on the day after the previous one
    Extended,
    /// Gap covered entirely by shields
    Protected,
    /// Gap not covered; streak restarted at one
    Reset,
    /// Day already counted
    AlreadyRecorded,
}

/// Milestone credit granted by a streak update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneReward {
    /// Threshold crossed
    pub threshold_days: u32,
    /// Credit entry
    pub entry: LedgerEntry,
}

/// Result of `update_streak`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakUpdate {
    /// Streak after the update
    pub current_streak_days: u32,
    /// Best streak after the update
    pub longest_streak_days: u32,
    /// Shields spent by this update
    pub shields_consumed: u32,
    /// Milestone credits newly granted by this update
    pub milestone_rewards_granted: Vec<MilestoneReward>,
    /// Transition taken
    pub outcome: StreakOutcome,
}

/// Date range filter, inclusive on both ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    /// Earliest `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Latest `created_at`
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Whether `at` falls inside the range
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Filters for `get_user_ledger`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    /// Only this currency
    pub currency: Option<CurrencyType>,
    /// Only this reason
    pub reason: Option<Reason>,
    /// Only entries created within the range
    pub date_range: DateRange,
    /// Continue after this cursor (from a previous page)
    pub cursor: Option<String>,
    /// Page size (defaults and caps come from config)
    pub limit: Option<usize>,
}

/// One page of entries, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPage {
    /// Entries in `created_at` descending order
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the next page, `None` when exhausted
    pub next_cursor: Option<String>,
}

/// Result of a successful chain replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAudit {
    /// Wallet owner
    pub user_id: UserId,
    /// Wallet currency
    pub currency: CurrencyType,
    /// Entries replayed
    pub entries: u64,
    /// Balance reproduced by the replay
    pub balance: i64,
    /// Hash of the last entry
    pub head_hash: [u8; 32],
}
