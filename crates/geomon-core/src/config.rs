//! Configuration management for geomon
//!
//! Values are read from the process environment, falling back to a `.env`
//! file in the working directory.

use crate::error::Result;
use crate::models::{HISTORY_CAP, RETENTION_DAYS};
use crate::thresholds::ThresholdCatalog;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Flush cadence used when `GEOMON_TEST_MODE` is set.
pub const TEST_MODE_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Floor applied to every worker period.
pub const MIN_WORKER_INTERVAL: Duration = Duration::from_secs(1);

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root directory of the file-backed store.
    pub storage_root: PathBuf,
    /// Threshold limit file; `None` selects the built-in catalog.
    pub thresholds_path: Option<PathBuf>,

    pub retention_days: u64,
    pub history_cap: usize,

    // Worker periods
    pub counts_refresh_interval: Duration,
    pub stats_refresh_interval: Duration,
    pub stats_flush_interval: Duration,

    /// Persist immediately when a sample moves by more than this fraction of
    /// the last persisted value. Disabled when `None`.
    pub stats_change_ratio: Option<f64>,
    pub test_mode: bool,

    // Store concurrency
    pub cas_max_retries: u32,
    pub store_lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./geomon_store"),
            thresholds_path: None,
            retention_days: RETENTION_DAYS.unsigned_abs(),
            history_cap: HISTORY_CAP,
            counts_refresh_interval: Duration::from_secs(60),
            stats_refresh_interval: Duration::from_secs(60),
            stats_flush_interval: Duration::from_secs(300),
            stats_change_ratio: None,
            test_mode: false,
            cas_max_retries: 16,
            store_lock_timeout: Duration::from_millis(5000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_value("GEOMON_STORAGE_ROOT") {
            let v = v.trim();
            if !v.is_empty() {
                config.storage_root = PathBuf::from(v);
            }
        }
        config.thresholds_path = env_value("GEOMON_THRESHOLDS_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        config.retention_days = env_u64("GEOMON_RETENTION_DAYS", config.retention_days).max(1);
        config.history_cap = env_usize("GEOMON_HISTORY_CAP", config.history_cap).max(1);

        config.counts_refresh_interval =
            env_interval("GEOMON_COUNTS_REFRESH_SECONDS", config.counts_refresh_interval);
        config.stats_refresh_interval =
            env_interval("GEOMON_STATS_REFRESH_SECONDS", config.stats_refresh_interval);
        config.stats_flush_interval =
            env_interval("GEOMON_STATS_FLUSH_SECONDS", config.stats_flush_interval);

        config.stats_change_ratio =
            env_f64_opt("GEOMON_STATS_CHANGE_RATIO").filter(|r| r.is_finite() && *r > 0.0);
        config.test_mode = env_bool("GEOMON_TEST_MODE", config.test_mode);

        config.cas_max_retries =
            u32::try_from(env_u64("GEOMON_CAS_MAX_RETRIES", u64::from(config.cas_max_retries)))
                .unwrap_or(u32::MAX)
                .max(1);
        config.store_lock_timeout = Duration::from_millis(env_u64(
            "GEOMON_STORE_LOCK_TIMEOUT_MS",
            u64::try_from(config.store_lock_timeout.as_millis()).unwrap_or(u64::MAX),
        ));

        config
    }

    /// Retention window as a calendar duration.
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::try_from(self.retention_days).unwrap_or(RETENTION_DAYS))
    }

    /// Flush period after applying test mode.
    #[must_use]
    pub fn effective_flush_interval(&self) -> Duration {
        if self.test_mode {
            TEST_MODE_FLUSH_INTERVAL
        } else {
            self.stats_flush_interval
        }
    }

    /// Load the configured limit file, or the built-in catalog when none is set.
    pub fn threshold_catalog(&self) -> Result<ThresholdCatalog> {
        self.thresholds_path
            .as_deref()
            .map_or_else(|| Ok(ThresholdCatalog::builtin()), ThresholdCatalog::load)
    }
}

// Helper functions for environment variable parsing

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(Path::new(".env")))
}

/// Read a value from the real environment first, falling back to .env.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    #[cfg(test)]
    if TEST_ENV_OVERRIDES.with(|cell| !cell.borrow().is_empty()) {
        // Isolate override-driven tests from the developer's shell.
        return None;
    }
    env::var(key).ok().or_else(|| dotenv_values().get(key).cloned())
}

fn load_dotenv_file(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse_dotenv_contents(&contents)
}

/// Parse `KEY=value` lines; blank lines, comments and an `export ` prefix are
/// tolerated, and a single pair of surrounding quotes is stripped.
#[must_use]
pub fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    map
}

fn unquote(raw: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    raw
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64_opt(key: &str) -> Option<f64> {
    env_value(key).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            trimmed.parse().ok()
        }
    })
}

fn env_interval(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_u64(key, default.as_secs())).max(MIN_WORKER_INTERVAL)
}
