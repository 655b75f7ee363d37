//! Daily streak tracking with shield protection
//!
//! # Transitions
//!
//! For a qualifying activity on day `D` with last activity `L`:
//!
//! ```text
//! L absent           -> Started          streak = 1
//! L == D             -> AlreadyRecorded  no change
//! L == D - 1         -> Extended         streak + 1
//! L <= D - 2, gap g  -> Protected        streak + 1, g shields spent   (shields >= g)
//!                    -> Reset            streak = 1, no shields spent  (shields <  g)
//! D < L              -> StreakConsistency error, nothing written
//! ```
//!
//! The streak row, the shield debits and the milestone credits share one
//! store transaction.

use crate::{
    config::{MilestoneConfig, StreakConfig},
    ledger::{apply_transaction, Applied},
    storage::StoreTxn,
    types::{
        CurrencyType, Metadata, MilestoneReward, Reason, StreakOutcome, StreakState, StreakUpdate,
        TransactionRequest, TransactionType, UserId,
    },
    Error, Ledger, Result,
};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;

/// Decision for one activity, before anything is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakPlan {
    /// Transition taken
    pub outcome: StreakOutcome,
    /// Streak after the transition
    pub current_streak_days: u32,
    /// Shields to debit
    pub shields_to_consume: u32,
}

/// Decide the transition for an activity on `date`
pub fn plan_transition(state: &StreakState, date: NaiveDate, shields_available: i64) -> Result<StreakPlan> {
    if state.longest_streak_days < state.current_streak_days {
        return Err(Error::StreakConsistency(format!(
            "{}: longest streak {} below current {}",
            state.user_id, state.longest_streak_days, state.current_streak_days
        )));
    }

    let last = match state.last_activity_date {
        None => {
            if state.current_streak_days != 0 {
                return Err(Error::StreakConsistency(format!(
                    "{}: streak of {} days without an activity date",
                    state.user_id, state.current_streak_days
                )));
            }
            return Ok(StreakPlan {
                outcome: StreakOutcome::Started,
                current_streak_days: 1,
                shields_to_consume: 0,
            });
        }
        Some(last) => last,
    };

    if date < last {
        return Err(Error::StreakConsistency(format!(
            "{}: activity date {} precedes last activity {}",
            state.user_id, date, last
        )));
    }

    if date == last {
        return Ok(StreakPlan {
            outcome: StreakOutcome::AlreadyRecorded,
            current_streak_days: state.current_streak_days,
            shields_to_consume: 0,
        });
    }

    if state.current_streak_days == 0 {
        return Err(Error::StreakConsistency(format!(
            "{}: last activity {} recorded with a zero streak",
            state.user_id, last
        )));
    }

    let extended = state.current_streak_days.checked_add(1).ok_or_else(|| {
        Error::StreakConsistency(format!("{}: streak counter overflow", state.user_id))
    })?;

    let missed = (date - last).num_days() - 1;
    if missed == 0 {
        return Ok(StreakPlan {
            outcome: StreakOutcome::Extended,
            current_streak_days: extended,
            shields_to_consume: 0,
        });
    }

    // The whole gap is covered or nothing is spent
    match u32::try_from(missed) {
        Ok(gap) if shields_available >= missed => Ok(StreakPlan {
            outcome: StreakOutcome::Protected,
            current_streak_days: extended,
            shields_to_consume: gap,
        }),
        _ => Ok(StreakPlan {
            outcome: StreakOutcome::Reset,
            current_streak_days: 1,
            shields_to_consume: 0,
        }),
    }
}

pub(crate) fn shield_idempotency_key(user_id: &UserId, date: NaiveDate, ordinal: u32) -> String {
    format!("streak-shield/{}/{}/{}", user_id, date, ordinal)
}

pub(crate) fn milestone_idempotency_key(user_id: &UserId, threshold_days: u32) -> String {
    format!("streak-milestone/{}/{}", user_id, threshold_days)
}

/// Apply one activity inside `txn`
fn advance_streak(
    txn: &StoreTxn<'_>,
    user_id: &UserId,
    date: NaiveDate,
    milestones: &[MilestoneConfig],
) -> Result<StreakUpdate> {
    let mut state = match txn.streak_for_update(user_id)? {
        Some(state) => state,
        None => StreakState::new(user_id.clone(), txn.now()),
    };
    let shields = txn
        .wallet_for_update(user_id, CurrencyType::Shields)?
        .map_or(0, |wallet| wallet.balance);

    let plan = plan_transition(&state, date, shields)?;

    if plan.outcome == StreakOutcome::AlreadyRecorded {
        return Ok(StreakUpdate {
            current_streak_days: state.current_streak_days,
            longest_streak_days: state.longest_streak_days,
            shields_consumed: 0,
            milestone_rewards_granted: Vec::new(),
            outcome: plan.outcome,
        });
    }

    for ordinal in 1..=plan.shields_to_consume {
        let mut metadata = Metadata::new();
        metadata.insert("activity_date".to_string(), date.to_string());
        metadata.insert("gap_days".to_string(), plan.shields_to_consume.to_string());

        let request = TransactionRequest::new(
            user_id.clone(),
            CurrencyType::Shields,
            -1,
            Reason::ShieldConsumed,
            shield_idempotency_key(user_id, date, ordinal),
            TransactionType::Spend,
        )
        .with_metadata(metadata);

        // A replay here means no shield was paid for this gap
        if let Applied::Replayed(entry) = apply_transaction(txn, &request)? {
            return Err(Error::StreakConsistency(format!(
                "{}: shield key {} already used by entry {}",
                user_id, request.idempotency_key, entry.id
            )));
        }
    }

    state.current_streak_days = plan.current_streak_days;
    state.longest_streak_days = state.longest_streak_days.max(plan.current_streak_days);
    state.last_activity_date = Some(date);
    state.shields_used_to_date += u64::from(plan.shields_to_consume);
    state.updated_at = txn.now();
    txn.put_streak(&state)?;

    let mut granted = Vec::new();
    for milestone in milestones
        .iter()
        .filter(|milestone| state.current_streak_days >= milestone.days)
    {
        let mut metadata = Metadata::new();
        metadata.insert("threshold_days".to_string(), milestone.days.to_string());

        let request = TransactionRequest::new(
            user_id.clone(),
            milestone.currency,
            milestone.amount,
            Reason::StreakMilestone,
            milestone_idempotency_key(user_id, milestone.days),
            TransactionType::Earn,
        )
        .with_metadata(metadata);

        match apply_transaction(txn, &request)? {
            Applied::Recorded(entry) => granted.push(MilestoneReward {
                threshold_days: milestone.days,
                entry,
            }),
            // Paid earlier, but only if the key holds this user's own credit
            Applied::Replayed(entry)
                if entry.user_id == *user_id
                    && entry.reason == Reason::StreakMilestone
                    && entry.currency == milestone.currency => {}
            Applied::Replayed(entry) => {
                return Err(Error::StreakConsistency(format!(
                    "{}: milestone key {} already used by entry {}",
                    user_id, request.idempotency_key, entry.id
                )));
            }
        }
    }

    Ok(StreakUpdate {
        current_streak_days: state.current_streak_days,
        longest_streak_days: state.longest_streak_days,
        shields_consumed: plan.shields_to_consume,
        milestone_rewards_granted: granted,
        outcome: plan.outcome,
    })
}

/// Streak tracker handle (cheap to clone)
#[derive(Debug, Clone)]
pub struct StreakTracker {
    ledger: Ledger,
    milestones: Arc<Vec<MilestoneConfig>>,
}

impl StreakTracker {
    /// Create a tracker recording through `ledger`
    pub fn new(ledger: Ledger, config: StreakConfig) -> Self {
        let mut milestones = config.milestones;
        milestones.sort_by_key(|milestone| milestone.days);
        Self {
            ledger,
            milestones: Arc::new(milestones),
        }
    }

    /// Record a qualifying activity on `activity_date`
    pub async fn update_streak(&self, user_id: &UserId, activity_date: NaiveDate) -> Result<StreakUpdate> {
        user_id.validate()?;

        let user = user_id.clone();
        let milestones = Arc::clone(&self.milestones);

        let result = self
            .ledger
            .atomic(move |txn| advance_streak(txn, &user, activity_date, &milestones))
            .await;

        let update = match result {
            Ok(update) => update,
            Err(err @ Error::StreakConsistency(_)) => {
                tracing::error!(
                    user_id = %user_id,
                    activity_date = %activity_date,
                    error = %err,
                    "Streak update refused"
                );
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if update.outcome == StreakOutcome::AlreadyRecorded {
            tracing::debug!(user_id = %user_id, activity_date = %activity_date, "Streak day already recorded");
            return Ok(update);
        }

        let metrics = self.ledger.metrics();
        metrics.record_streak_update(
            update.outcome == StreakOutcome::Reset,
            update.shields_consumed,
            update.milestone_rewards_granted.len(),
        );
        metrics.record_entries(
            u64::from(update.shields_consumed) + update.milestone_rewards_granted.len() as u64,
        );

        tracing::debug!(
            user_id = %user_id,
            activity_date = %activity_date,
            outcome = ?update.outcome,
            current_streak_days = update.current_streak_days,
            shields_consumed = update.shields_consumed,
            "Streak updated"
        );
        for reward in &update.milestone_rewards_granted {
            tracing::info!(
                user_id = %user_id,
                threshold_days = reward.threshold_days,
                currency = %reward.entry.currency,
                amount = reward.entry.amount,
                "Streak milestone reached"
            );
        }

        Ok(update)
    }

    /// Record a qualifying activity today (UTC)
    pub async fn update_streak_today(&self, user_id: &UserId) -> Result<StreakUpdate> {
        self.update_streak(user_id, Utc::now().date_naive()).await
    }

    /// Current streak state with the live shield balance
    pub async fn get_streak(&self, user_id: &UserId) -> Result<StreakState> {
        user_id.validate()?;

        let storage = Arc::clone(self.ledger.storage());
        let user_id = user_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut state = storage
                .get_streak(&user_id)?
                .unwrap_or_else(|| StreakState::new(user_id.clone(), Utc::now()));
            state.shields_available = storage
                .get_wallet(&user_id, CurrencyType::Shields)?
                .map_or(0, |wallet| wallet.balance);
            Ok::<_, Error>(state)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::Metrics, Config, Storage, Wallet};
    use tempfile::TempDir;

    struct Fixture {
        tracker: StreakTracker,
        wallet: Wallet,
        ledger: Ledger,
        _temp: TempDir,
    }

    fn fixture_with(config: Config) -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let ledger = Ledger::new(storage, &config, Metrics::new().unwrap());
        Fixture {
            tracker: StreakTracker::new(ledger.clone(), config.streak.clone()),
            wallet: Wallet::new(ledger.clone(), config.levels.clone()),
            ledger,
            _temp: temp_dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default())
    }

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + chrono::Duration::days(n)
    }

    fn state(current: u32, longest: u32, last: Option<NaiveDate>) -> StreakState {
        StreakState {
            user_id: UserId::new("user-1"),
            current_streak_days: current,
            longest_streak_days: longest,
            last_activity_date: last,
            shields_available: 0,
            shields_used_to_date: 0,
            updated_at: Utc::now(),
        }
    }

    async fn grant_shields(f: &Fixture, user: &UserId, amount: i64) {
        f.wallet
            .credit(user, CurrencyType::Shields, amount, Reason::ShieldPurchased, "shield-grant")
            .await
            .unwrap();
    }

    // Writes below the caller key check, as the tracker itself does
    async fn occupy_key(f: &Fixture, request: TransactionRequest) {
        let applied = f
            .ledger
            .atomic(move |txn| apply_transaction(txn, &request))
            .await
            .unwrap();
        assert!(applied.is_new());
    }

    async fn count_reason(f: &Fixture, user: &UserId, reason: Reason) -> usize {
        f.ledger
            .get_user_ledger(
                user,
                crate::types::LedgerFilter {
                    reason: Some(reason),
                    limit: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .entries
            .len()
    }

    #[test]
    fn test_plan_transitions() {
        let plan = plan_transition(&state(0, 0, None), day(0), 0).unwrap();
        assert_eq!(plan.outcome, StreakOutcome::Started);
        assert_eq!(plan.current_streak_days, 1);

        let plan = plan_transition(&state(3, 5, Some(day(0))), day(1), 0).unwrap();
        assert_eq!(plan.outcome, StreakOutcome::Extended);
        assert_eq!(plan.current_streak_days, 4);

        let plan = plan_transition(&state(3, 5, Some(day(0))), day(3), 2).unwrap();
        assert_eq!(plan.outcome, StreakOutcome::Protected);
        assert_eq!(plan.shields_to_consume, 2);
        assert_eq!(plan.current_streak_days, 4);

        let plan = plan_transition(&state(3, 5, Some(day(0))), day(3), 1).unwrap();
        assert_eq!(plan.outcome, StreakOutcome::Reset);
        assert_eq!(plan.shields_to_consume, 0);
        assert_eq!(plan.current_streak_days, 1);

        let plan = plan_transition(&state(3, 5, Some(day(0))), day(0), 9).unwrap();
        assert_eq!(plan.outcome, StreakOutcome::AlreadyRecorded);
    }

    #[test]
    fn test_plan_rejects_inconsistent_state() {
        let err = plan_transition(&state(3, 5, Some(day(4))), day(2), 0).unwrap_err();
        assert!(matches!(err, Error::StreakConsistency(_)));

        let err = plan_transition(&state(6, 5, Some(day(4))), day(5), 0).unwrap_err();
        assert!(matches!(err, Error::StreakConsistency(_)));

        let err = plan_transition(&state(2, 2, None), day(5), 0).unwrap_err();
        assert!(matches!(err, Error::StreakConsistency(_)));
    }

    #[tokio::test]
    async fn test_first_activity_and_consecutive_days() {
        let f = fixture();
        let user = UserId::new("user-1");

        let first = f.tracker.update_streak(&user, day(0)).await.unwrap();
        assert_eq!(first.outcome, StreakOutcome::Started);
        assert_eq!(first.current_streak_days, 1);

        let second = f.tracker.update_streak(&user, day(1)).await.unwrap();
        assert_eq!(second.outcome, StreakOutcome::Extended);
        assert_eq!(second.current_streak_days, 2);
        assert_eq!(second.longest_streak_days, 2);

        let state = f.tracker.get_streak(&user).await.unwrap();
        assert_eq!(state.last_activity_date, Some(day(1)));
    }

    #[tokio::test]
    async fn test_shield_covers_gap_and_grants_milestone_once() {
        let f = fixture();
        let user = UserId::new("user-1");

        for n in 0..6 {
            f.tracker.update_streak(&user, day(n)).await.unwrap();
        }
        grant_shields(&f, &user, 2).await;

        // Skip day 6
        let update = f.tracker.update_streak(&user, day(7)).await.unwrap();
        assert_eq!(update.outcome, StreakOutcome::Protected);
        assert_eq!(update.current_streak_days, 7);
        assert_eq!(update.shields_consumed, 1);
        assert_eq!(update.milestone_rewards_granted.len(), 1);
        assert_eq!(update.milestone_rewards_granted[0].threshold_days, 7);
        assert_eq!(update.milestone_rewards_granted[0].entry.amount, 50);

        let wallet = f.wallet.get_wallet(&user).await.unwrap();
        assert_eq!(wallet.shields, 1);
        assert_eq!(wallet.coins, 50);
        assert_eq!(count_reason(&f, &user, Reason::ShieldConsumed).await, 1);

        // Same day again
        let again = f.tracker.update_streak(&user, day(7)).await.unwrap();
        assert_eq!(again.outcome, StreakOutcome::AlreadyRecorded);
        assert_eq!(again.current_streak_days, 7);
        assert!(again.milestone_rewards_granted.is_empty());
        assert_eq!(f.wallet.get_wallet(&user).await.unwrap().coins, 50);
        assert_eq!(count_reason(&f, &user, Reason::StreakMilestone).await, 1);

        let state = f.tracker.get_streak(&user).await.unwrap();
        assert_eq!(state.shields_used_to_date, 1);
        assert_eq!(state.shields_available, 1);
    }

    #[tokio::test]
    async fn test_no_shields_resets_streak() {
        let f = fixture();
        let user = UserId::new("user-1");

        for n in 0..4 {
            f.tracker.update_streak(&user, day(n)).await.unwrap();
        }

        // Skip days 4 and 5
        let update = f.tracker.update_streak(&user, day(6)).await.unwrap();
        assert_eq!(update.outcome, StreakOutcome::Reset);
        assert_eq!(update.current_streak_days, 1);
        assert_eq!(update.longest_streak_days, 4);
        assert_eq!(update.shields_consumed, 0);
        assert_eq!(count_reason(&f, &user, Reason::ShieldConsumed).await, 0);
    }

    #[tokio::test]
    async fn test_partial_cover_spends_nothing() {
        let f = fixture();
        let user = UserId::new("user-1");

        f.tracker.update_streak(&user, day(0)).await.unwrap();
        grant_shields(&f, &user, 1).await;

        // Two missed days, one shield
        let update = f.tracker.update_streak(&user, day(3)).await.unwrap();
        assert_eq!(update.outcome, StreakOutcome::Reset);
        assert_eq!(update.shields_consumed, 0);
        assert_eq!(f.wallet.get_balance(&user, CurrencyType::Shields).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_multi_day_gap_spends_one_shield_per_day() {
        let f = fixture();
        let user = UserId::new("user-1");

        f.tracker.update_streak(&user, day(0)).await.unwrap();
        grant_shields(&f, &user, 5).await;

        let update = f.tracker.update_streak(&user, day(4)).await.unwrap();
        assert_eq!(update.outcome, StreakOutcome::Protected);
        assert_eq!(update.shields_consumed, 3);
        assert_eq!(update.current_streak_days, 2);
        assert_eq!(f.wallet.get_balance(&user, CurrencyType::Shields).await.unwrap(), 2);

        let audit = f.ledger.verify_chain(&user, CurrencyType::Shields).await.unwrap();
        assert_eq!(audit.entries, 4);
        assert_eq!(audit.balance, 2);
    }

    #[tokio::test]
    async fn test_date_regression_fails_closed() {
        let f = fixture();
        let user = UserId::new("user-1");

        f.tracker.update_streak(&user, day(5)).await.unwrap();
        let err = f.tracker.update_streak(&user, day(4)).await.unwrap_err();
        assert!(matches!(err, Error::StreakConsistency(_)));

        let state = f.tracker.get_streak(&user).await.unwrap();
        assert_eq!(state.last_activity_date, Some(day(5)));
        assert_eq!(state.current_streak_days, 1);
    }

    #[tokio::test]
    async fn test_milestone_not_repaid_after_reset() {
        let mut config = Config::default();
        config.streak.milestones = vec![MilestoneConfig {
            days: 2,
            currency: CurrencyType::Xp,
            amount: 20,
        }];
        let f = fixture_with(config);
        let user = UserId::new("user-1");

        f.tracker.update_streak(&user, day(0)).await.unwrap();
        let reached = f.tracker.update_streak(&user, day(1)).await.unwrap();
        assert_eq!(reached.milestone_rewards_granted.len(), 1);

        let reset = f.tracker.update_streak(&user, day(5)).await.unwrap();
        assert_eq!(reset.outcome, StreakOutcome::Reset);

        let again = f.tracker.update_streak(&user, day(6)).await.unwrap();
        assert_eq!(again.current_streak_days, 2);
        assert!(again.milestone_rewards_granted.is_empty());
        assert_eq!(f.wallet.get_balance(&user, CurrencyType::Xp).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failed_shield_debit_aborts_update() {
        let f = fixture();
        let user = UserId::new("user-1");

        f.tracker.update_streak(&user, day(0)).await.unwrap();
        grant_shields(&f, &user, 3).await;

        // Occupy the key the tracker would use for the first shield
        let squatter = TransactionRequest::new(
            UserId::new("someone-else"),
            CurrencyType::Xp,
            1,
            Reason::AdminAdjustment,
            shield_idempotency_key(&user, day(2), 1),
            TransactionType::Adjustment,
        );
        occupy_key(&f, squatter).await;

        let err = f.tracker.update_streak(&user, day(2)).await.unwrap_err();
        assert!(matches!(err, Error::StreakConsistency(_)));

        let state = f.tracker.get_streak(&user).await.unwrap();
        assert_eq!(state.last_activity_date, Some(day(0)));
        assert_eq!(state.shields_used_to_date, 0);
        assert_eq!(state.shields_available, 3);
    }

    #[tokio::test]
    async fn test_foreign_milestone_key_aborts_update() {
        let mut config = Config::default();
        config.streak.milestones = vec![MilestoneConfig {
            days: 2,
            currency: CurrencyType::Coins,
            amount: 50,
        }];
        let f = fixture_with(config);
        let user = UserId::new("user-1");

        // Another user's entry sits on this user's milestone key
        let squatter = TransactionRequest::new(
            UserId::new("someone-else"),
            CurrencyType::Xp,
            1,
            Reason::QuizCompleted,
            milestone_idempotency_key(&user, 2),
            TransactionType::Earn,
        );
        occupy_key(&f, squatter).await;

        f.tracker.update_streak(&user, day(0)).await.unwrap();
        let err = f.tracker.update_streak(&user, day(1)).await.unwrap_err();
        assert!(matches!(err, Error::StreakConsistency(_)));

        let state = f.tracker.get_streak(&user).await.unwrap();
        assert_eq!(state.current_streak_days, 1);
        assert_eq!(state.last_activity_date, Some(day(0)));
        assert_eq!(f.wallet.get_balance(&user, CurrencyType::Coins).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_own_milestone_replay_is_not_an_error() {
        let mut config = Config::default();
        config.streak.milestones = vec![MilestoneConfig {
            days: 1,
            currency: CurrencyType::Coins,
            amount: 5,
        }];
        let f = fixture_with(config);
        let user = UserId::new("user-1");

        let first = f.tracker.update_streak(&user, day(0)).await.unwrap();
        assert_eq!(first.milestone_rewards_granted.len(), 1);

        let next = f.tracker.update_streak(&user, day(1)).await.unwrap();
        assert_eq!(next.outcome, StreakOutcome::Extended);
        assert!(next.milestone_rewards_granted.is_empty());
        assert_eq!(f.wallet.get_balance(&user, CurrencyType::Coins).await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_day_counts_once() {
        let f = fixture();
        let user = UserId::new("user-1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = f.tracker.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move { tracker.update_streak(&user, day(0)).await }));
        }

        let mut started = 0;
        for handle in handles {
            let update = handle.await.unwrap().unwrap();
            assert_eq!(update.current_streak_days, 1);
            if update.outcome == StreakOutcome::Started {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_unknown_user_has_empty_streak() {
        let f = fixture();

        let state = f.tracker.get_streak(&UserId::new("nobody")).await.unwrap();
        assert_eq!(state.current_streak_days, 0);
        assert_eq!(state.last_activity_date, None);
    }
}
