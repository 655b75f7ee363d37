//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `rewards_ledger_entries_total` - Entries appended
//! - `rewards_ledger_replays_total` - Requests answered by idempotent replay
//! - `rewards_ledger_insufficient_balance_total` - Debits rejected
//! - `rewards_ledger_conflict_retries_total` - Retries after lock conflicts
//! - `rewards_ledger_transaction_duration_seconds` - Store transaction latency
//! - `rewards_streak_updates_total` - Streak updates that moved the streak
//! - `rewards_streak_resets_total` - Streaks broken by an uncovered gap
//! - `rewards_streak_shields_consumed_total` - Shields spent on gaps
//! - `rewards_streak_milestones_total` - Milestone rewards granted

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Entries appended
    pub entries_total: IntCounter,

    /// Idempotent replays
    pub replays_total: IntCounter,

    /// Debits rejected for insufficient balance
    pub insufficient_balance_total: IntCounter,

    /// Conflict retries
    pub conflict_retries_total: IntCounter,

    /// Transaction duration histogram
    pub transaction_duration: Histogram,

    /// Streak updates that changed state
    pub streak_updates_total: IntCounter,

    /// Streak resets
    pub streak_resets_total: IntCounter,

    /// Shields consumed
    pub shields_consumed_total: IntCounter,

    /// Milestones granted
    pub milestones_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let entries_total = counter("rewards_ledger_entries_total", "Entries appended")?;
        let replays_total = counter(
            "rewards_ledger_replays_total",
            "Requests answered by idempotent replay",
        )?;
        let insufficient_balance_total = counter(
            "rewards_ledger_insufficient_balance_total",
            "Debits rejected for insufficient balance",
        )?;
        let conflict_retries_total = counter(
            "rewards_ledger_conflict_retries_total",
            "Retries after lock timeouts or deadlocks",
        )?;
        let streak_updates_total = counter(
            "rewards_streak_updates_total",
            "Streak updates that changed state",
        )?;
        let streak_resets_total = counter(
            "rewards_streak_resets_total",
            "Streaks broken by an uncovered gap",
        )?;
        let shields_consumed_total = counter(
            "rewards_streak_shields_consumed_total",
            "Shields spent covering missed days",
        )?;
        let milestones_total = counter(
            "rewards_streak_milestones_total",
            "Milestone rewards granted",
        )?;

        let transaction_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rewards_ledger_transaction_duration_seconds",
                "Histogram of store transaction latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(transaction_duration.clone()))?;

        Ok(Self {
            entries_total,
            replays_total,
            insufficient_balance_total,
            conflict_retries_total,
            transaction_duration,
            streak_updates_total,
            streak_resets_total,
            shields_consumed_total,
            milestones_total,
            registry,
        })
    }

    /// Record a newly appended entry
    pub fn record_entry(&self) {
        self.entries_total.inc();
    }

    /// Record entries appended as part of a streak update
    pub fn record_entries(&self, count: u64) {
        self.entries_total.inc_by(count);
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record a rejected debit
    pub fn record_insufficient_balance(&self) {
        self.insufficient_balance_total.inc();
    }

    /// Record a retry after a conflict
    pub fn record_conflict_retry(&self) {
        self.conflict_retries_total.inc();
    }

    /// Record transaction duration
    pub fn record_transaction_duration(&self, duration_seconds: f64) {
        self.transaction_duration.observe(duration_seconds);
    }

    /// Record a streak transition
    pub fn record_streak_update(&self, reset: bool, shields_consumed: u32, milestones: usize) {
        self.streak_updates_total.inc();
        if reset {
            self.streak_resets_total.inc();
        }
        self.shields_consumed_total.inc_by(u64::from(shields_consumed));
        self.milestones_total.inc_by(milestones as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
