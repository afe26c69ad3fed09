//! Daemon configuration.
//!
//! Each daemon gets one config struct with serde derives and full defaults, so
//! a bare `vigild necromancer` runs without a settings file. Validation runs
//! once at startup and is fatal; nothing re-checks these values per cycle.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};
use crate::rse::RseFilter;

/// Connection settings for the catalog database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    pub max_connections: u32,
    /// How long to wait for a pooled connection before giving up (seconds).
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://vigil@localhost/vigil".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Tuning for the bad-replica recovery daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NecromancerConfig {
    /// Worker pool size for processing a batch.
    pub threads: usize,
    /// Batch size per pull.
    pub bulk: usize,
    /// Idle delay between cycles (seconds). Skipped while a backlog remains.
    pub sleep_time_secs: u64,
    /// Execute one cycle and exit.
    pub run_once: bool,
    /// A replica stuck in Recovering longer than this is re-planned as if no
    /// repair were in flight (hours).
    pub recovering_timeout_hours: i64,
    /// When the total bad-replica backlog exceeds this, pulls are sharded
    /// across RSE groups instead of one global pull. Zero disables sharding.
    pub max_backlog: u64,
    /// How long a backlog snapshot stays fresh before it is re-counted
    /// (seconds).
    pub backlog_cache_secs: u64,
}

impl Default for NecromancerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            bulk: 1000,
            sleep_time_secs: 60,
            run_once: false,
            recovering_timeout_hours: 24,
            max_backlog: 0,
            backlog_cache_secs: 600,
        }
    }
}

impl NecromancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(config_err("necromancer.threads must be at least 1"));
        }
        if self.bulk == 0 {
            return Err(config_err("necromancer.bulk must be at least 1"));
        }
        if self.recovering_timeout_hours <= 0 {
            return Err(config_err(
                "necromancer.recovering_timeout_hours must be positive",
            ));
        }
        Ok(())
    }

    pub fn sleep_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sleep_time_secs)
    }

    pub fn recovering_timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(self.recovering_timeout_hours)
    }

    pub fn backlog_cache(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.backlog_cache_secs as i64)
    }
}

/// Tuning for the storage/catalog audit daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Worker pool size: how many RSEs are audited concurrently.
    pub threads: usize,
    /// Chunk size for catalog declarations (quarantine/suspicious batches).
    pub bulk: usize,
    /// Idle delay between cycles (seconds). Audits run on a daily cadence.
    pub sleep_time_secs: u64,
    /// Execute one cycle and exit.
    pub run_once: bool,
    /// Selection expression over RSE attributes (`tier=2 & site!=X`); `*`
    /// audits everything. Parsed once at startup.
    pub rses: String,
    /// Maximum tolerated skew between the storage and catalog dumps (days).
    pub delta_days: i64,
    /// Pin the storage dump to this date instead of using the newest.
    pub date: Option<NaiveDate>,
    /// Retain cached dump artifacts after the cycle.
    pub keep_dumps: bool,
    /// Suppression window for recently created/deleted entries (days).
    /// Defaults to `delta_days` when unset.
    pub recent_window_days: Option<i64>,
    /// Findings above this fraction of the audited dump's record count are
    /// written to the results file but not declared (bad-dump guard).
    pub sanity_threshold: f64,
    /// Write results files but perform no catalog actions.
    pub no_declaration: bool,
    /// How many days back to look for a usable dump when none exists for the
    /// requested date.
    pub lookback_days: u32,
    /// Where dump producers drop their listings
    /// (`<spool>/{storage,catalog}/<RSE>/dump_YYYYMMDD`).
    pub spool_dir: PathBuf,
    /// Working copies of dumps live here during a cycle.
    pub cache_dir: PathBuf,
    /// One results file per (RSE, storage-dump date) lands here.
    pub results_dir: PathBuf,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            bulk: 1000,
            sleep_time_secs: 86_400,
            run_once: false,
            rses: "*".to_string(),
            delta_days: 3,
            date: None,
            keep_dumps: false,
            recent_window_days: None,
            sanity_threshold: 0.1,
            no_declaration: false,
            lookback_days: 30,
            spool_dir: PathBuf::from("/var/lib/vigil/spool"),
            cache_dir: PathBuf::from("/var/lib/vigil/cache"),
            results_dir: PathBuf::from("/var/lib/vigil/results"),
        }
    }
}

impl AuditorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(config_err("auditor.threads must be at least 1"));
        }
        if self.bulk == 0 {
            return Err(config_err("auditor.bulk must be at least 1"));
        }
        if self.delta_days < 0 {
            return Err(config_err("auditor.delta_days must be nonnegative"));
        }
        if self.recent_window_days.is_some_and(|window| window < 0) {
            return Err(config_err(
                "auditor.recent_window_days must be nonnegative",
            ));
        }
        if !self.sanity_threshold.is_finite() || self.sanity_threshold <= 0.0 {
            return Err(config_err(
                "auditor.sanity_threshold must be a positive fraction",
            ));
        }
        if self.lookback_days == 0 {
            return Err(config_err("auditor.lookback_days must be at least 1"));
        }
        // Surfaces the typo at startup rather than mid-cycle.
        self.rse_filter()?;
        Ok(())
    }

    pub fn rse_filter(&self) -> Result<RseFilter> {
        RseFilter::parse(&self.rses)
    }

    pub fn sleep_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sleep_time_secs)
    }

    pub fn delta(&self) -> chrono::Duration {
        chrono::Duration::days(self.delta_days)
    }

    /// Effective recency-suppression window.
    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.recent_window_days.unwrap_or(self.delta_days))
    }
}

/// Top-level settings file (`--config <path>`, TOML). Every section is
/// optional; CLI flags override whatever the file sets.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub necromancer: NecromancerConfig,
    #[serde(default)]
    pub auditor: AuditorConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            config_err(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            config_err(format!("invalid settings file {}: {e}", path.display()))
        })
    }
}

fn config_err(msg: impl Into<String>) -> VigilError {
    VigilError::Config(msg.into())
}
