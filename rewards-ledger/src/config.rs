//! Configuration for the rewards ledger

use crate::types::{CurrencyType, LevelInfo, LevelTier};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Transaction locking and retry configuration
    pub transactions: TransactionConfig,

    /// Ledger query configuration
    pub query: QueryConfig,

    /// Level thresholds
    pub levels: LevelConfig,

    /// Streak milestones
    pub streak: StreakConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/rewards"),
            service_name: "rewards-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            rocksdb: RocksDBConfig::default(),
            transactions: TransactionConfig::default(),
            query: QueryConfig::default(),
            levels: LevelConfig::default(),
            streak: StreakConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Transaction locking and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long a transaction waits for a row lock (milliseconds)
    pub lock_timeout_ms: i64,

    /// Retries after a lock timeout or deadlock
    pub max_retries: u32,

    /// First backoff delay (milliseconds)
    pub backoff_base_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1_000,
            max_retries: 5,
            backoff_base_ms: 5,
            backoff_max_ms: 200,
        }
    }
}

impl TransactionConfig {
    /// Exponential backoff with full jitter for retry `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let ceiling = exp.min(self.backoff_max_ms).max(1);
        Duration::from_millis(rand::random::<u64>() % ceiling + 1)
    }
}

/// Ledger query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size when the caller gives none
    pub default_page_size: usize,

    /// Largest page a caller may request
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl QueryConfig {
    /// Clamp a requested page size
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

/// XP thresholds for each tier above bronze
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// XP needed for silver
    pub silver_xp: i64,

    /// XP needed for gold
    pub gold_xp: i64,

    /// XP needed for platinum
    pub platinum_xp: i64,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            silver_xp: 1_000,
            gold_xp: 5_000,
            platinum_xp: 20_000,
        }
    }
}

impl LevelConfig {
    /// XP at which `tier` starts
    pub fn threshold(&self, tier: LevelTier) -> i64 {
        match tier {
            LevelTier::Bronze => 0,
            LevelTier::Silver => self.silver_xp,
            LevelTier::Gold => self.gold_xp,
            LevelTier::Platinum => self.platinum_xp,
        }
    }

    /// Derive the tier for an XP balance
    pub fn level_for(&self, xp: i64) -> LevelInfo {
        let tier = if xp >= self.platinum_xp {
            LevelTier::Platinum
        } else if xp >= self.gold_xp {
            LevelTier::Gold
        } else if xp >= self.silver_xp {
            LevelTier::Silver
        } else {
            LevelTier::Bronze
        };

        let next_tier = tier.next();
        LevelInfo {
            tier,
            xp,
            next_tier,
            xp_to_next: next_tier.map(|next| self.threshold(next) - xp),
        }
    }
}

/// One milestone threshold and its reward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneConfig {
    /// Consecutive days required
    pub days: u32,

    /// Currency credited
    pub currency: CurrencyType,

    /// Amount credited (positive)
    pub amount: i64,
}

/// Streak configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreakConfig {
    /// Milestone thresholds, one credit each per user
    pub milestones: Vec<MilestoneConfig>,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            milestones: vec![
                MilestoneConfig { days: 7, currency: CurrencyType::Coins, amount: 50 },
                MilestoneConfig { days: 30, currency: CurrencyType::Coins, amount: 250 },
                MilestoneConfig { days: 100, currency: CurrencyType::Coins, amount: 1_000 },
            ],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("REWARDS_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("REWARDS_METRICS_ADDR") {
            self.metrics_listen_addr = addr;
        }

        if let Ok(level) = std::env::var("REWARDS_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("REWARDS_LOG_JSON") {
            self.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        if let Ok(timeout) = std::env::var("REWARDS_LOCK_TIMEOUT_MS") {
            self.transactions.lock_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid REWARDS_LOCK_TIMEOUT_MS: {}", e))
            })?;
        }

        self.validate()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        let levels = &self.levels;
        if !(0 < levels.silver_xp
            && levels.silver_xp < levels.gold_xp
            && levels.gold_xp < levels.platinum_xp)
        {
            return Err(crate::Error::Config(
                "Level thresholds must be positive and strictly ascending".to_string(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for milestone in &self.streak.milestones {
            if milestone.days == 0 || milestone.amount <= 0 {
                return Err(crate::Error::Config(format!(
                    "Milestone {} days / {} {} must be positive",
                    milestone.days, milestone.amount, milestone.currency
                )));
            }
            if !seen.insert(milestone.days) {
                return Err(crate::Error::Config(format!(
                    "Duplicate milestone threshold: {} days",
                    milestone.days
                )));
            }
        }

        if self.query.default_page_size == 0
            || self.query.default_page_size > self.query.max_page_size
        {
            return Err(crate::Error::Config(
                "default_page_size must be in 1..=max_page_size".to_string(),
            ));
        }

        if self.transactions.lock_timeout_ms <= 0 {
            return Err(crate::Error::Config("lock_timeout_ms must be positive".to_string()));
        }

        Ok(())
    }
}
