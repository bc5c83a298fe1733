//! Store configuration from environment variables
//!
//! Every knob has a default; `from_env` overrides what is set. Embedders and
//! tests use `StoreConfig::new(path)` plus the `with_*` builders instead.

use super::maintenance::RetentionPolicy;
use super::quality::QualityThresholds;
use super::validator::MIN_PLAUSIBLE_TIMESTAMP;
use crate::sqlite_pragma::PragmaSettings;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a `CandleStore`
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,

    /// Maximum pooled connections
    pub pool_size: u32,

    /// How long `acquire()` waits for a free connection (milliseconds)
    pub pool_timeout_ms: u64,

    /// SQLite busy_timeout per connection (milliseconds)
    pub busy_timeout_ms: u64,

    /// SQLite page cache size per connection (pages)
    pub cache_pages: i64,

    /// Records per ingestion transaction
    pub batch_size: usize,

    /// Log ingestion progress every N committed records
    pub progress_interval: usize,

    /// Whole-cache expiry (seconds)
    pub cache_ttl_secs: u64,

    /// Results with this many rows or more are not cached
    pub cache_max_rows: usize,

    /// Earliest accepted candle timestamp (unix seconds)
    pub min_timestamp: i64,

    /// Default retention window for cleanup
    pub retention: RetentionPolicy,

    /// Root directory for backup archives
    pub backup_dir: PathBuf,

    /// Extra directories captured by backups and replaced by restore
    pub tracked_dirs: Vec<PathBuf>,

    /// Background maintenance interval (seconds)
    pub maintenance_interval_secs: u64,

    /// Quality / coherence heuristics
    pub thresholds: QualityThresholds,
}

impl StoreConfig {
    /// Defaults for a store at `db_path`
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let backup_dir = db_path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));

        Self {
            db_path,
            pool_size: 10,
            pool_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            cache_pages: 10_000,
            batch_size: 10_000,
            progress_interval: 100_000,
            cache_ttl_secs: 300,
            cache_max_rows: 50_000,
            min_timestamp: MIN_PLAUSIBLE_TIMESTAMP,
            retention: RetentionPolicy::default(),
            backup_dir,
            tracked_dirs: Vec::new(),
            maintenance_interval_secs: 3_600,
            thresholds: QualityThresholds::default(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CANDLESTORE_DB_PATH` (default: data/candlestore.db)
    /// - `STORE_POOL_SIZE` (default: 10)
    /// - `STORE_POOL_TIMEOUT_MS` (default: 5000)
    /// - `STORE_BUSY_TIMEOUT_MS` (default: 5000)
    /// - `STORE_CACHE_PAGES` (default: 10000)
    /// - `STORE_BATCH_SIZE` (default: 10000)
    /// - `STORE_PROGRESS_INTERVAL` (default: 100000)
    /// - `QUERY_CACHE_TTL_SECS` (default: 300)
    /// - `QUERY_CACHE_MAX_ROWS` (default: 50000)
    /// - `RETENTION_DAYS` (default: 365)
    /// - `BACKUP_DIR` (default: `<db dir>/backups`)
    /// - `BACKUP_TRACKED_DIRS` (comma-separated, default: none)
    /// - `MAINTENANCE_INTERVAL_SECS` (default: 3600)
    /// - `QUALITY_MAX_BODY_MOVE` (default: 0.20)
    /// - `QUALITY_MAX_RANGE` (default: 0.30)
    /// - `QUALITY_GAP_MULTIPLIER` (default: 2.0)
    /// - `COHERENCE_LOW_THRESHOLD` (default: 0.95)
    pub fn from_env() -> Self {
        let db_path = env::var("CANDLESTORE_DB_PATH")
            .unwrap_or_else(|_| "data/candlestore.db".to_string());

        let mut config = Self::new(db_path);

        config.pool_size = env_parse("STORE_POOL_SIZE", config.pool_size);
        config.pool_timeout_ms = env_parse("STORE_POOL_TIMEOUT_MS", config.pool_timeout_ms);
        config.busy_timeout_ms = env_parse("STORE_BUSY_TIMEOUT_MS", config.busy_timeout_ms);
        config.cache_pages = env_parse("STORE_CACHE_PAGES", config.cache_pages);
        config.batch_size = env_parse("STORE_BATCH_SIZE", config.batch_size);
        config.progress_interval = env_parse("STORE_PROGRESS_INTERVAL", config.progress_interval);
        config.cache_ttl_secs = env_parse("QUERY_CACHE_TTL_SECS", config.cache_ttl_secs);
        config.cache_max_rows = env_parse("QUERY_CACHE_MAX_ROWS", config.cache_max_rows);
        config.retention.max_age_days =
            env_parse("RETENTION_DAYS", config.retention.max_age_days);
        config.maintenance_interval_secs =
            env_parse("MAINTENANCE_INTERVAL_SECS", config.maintenance_interval_secs);

        if let Ok(dir) = env::var("BACKUP_DIR") {
            config.backup_dir = PathBuf::from(dir);
        }

        config.tracked_dirs = env::var("BACKUP_TRACKED_DIRS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let t = &mut config.thresholds;
        t.max_body_move = env_parse("QUALITY_MAX_BODY_MOVE", t.max_body_move);
        t.max_range = env_parse("QUALITY_MAX_RANGE", t.max_range);
        t.gap_multiplier = env_parse("QUALITY_GAP_MULTIPLIER", t.gap_multiplier);
        t.low_coherence = env_parse("COHERENCE_LOW_THRESHOLD", t.low_coherence);

        config
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_secs = ttl_secs;
        self
    }

    pub fn with_cache_max_rows(mut self, max_rows: usize) -> Self {
        self.cache_max_rows = max_rows;
        self
    }

    pub fn with_min_timestamp(mut self, min_timestamp: i64) -> Self {
        self.min_timestamp = min_timestamp;
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn with_tracked_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.tracked_dirs = dirs;
        self
    }

    pub fn with_thresholds(mut self, thresholds: QualityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn pragma_settings(&self) -> PragmaSettings {
        PragmaSettings {
            cache_pages: self.cache_pages,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            ..PragmaSettings::default()
        }
    }

    /// Reject settings that would make the store unusable
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".to_string());
        }
        if self.pool_timeout_ms == 0 {
            return Err("pool_timeout_ms must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.progress_interval == 0 {
            return Err("progress_interval must be at least 1".to_string());
        }
        self.thresholds.validate()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
