//! Cache configuration
//!
//! [`CacheConfig`] is built once at start-up, normally from the process
//! environment with [`CacheConfig::from_env`], and passed into constructors.
//! Nothing else in the crate reads environment variables.

use crate::lock::LockOptions;
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Explicit cache root override
pub const ENV_CACHE_DIR: &str = "CHAINREPLAY_CACHE_DIR";
/// Recorder mode (`record`, `replay` or `off`)
pub const ENV_MODE: &str = "CHAINREPLAY_MODE";
/// Log verbosity for the binary
pub const ENV_LOG_LEVEL: &str = "CHAINREPLAY_LOG_LEVEL";
/// Enables substitution of live batches with cached ones
pub const ENV_AUTO_USE: &str = "CHAINREPLAY_AUTO_USE";
/// Requires gapless coverage before substituting
pub const ENV_REQUIRE_FULL_COVERAGE: &str = "CHAINREPLAY_REQUIRE_FULL_COVERAGE";
/// Lock wait budget in milliseconds
pub const ENV_LOCK_TIMEOUT_MS: &str = "CHAINREPLAY_LOCK_TIMEOUT_MS";
/// Lock staleness threshold in milliseconds
pub const ENV_LOCK_STALE_MS: &str = "CHAINREPLAY_LOCK_STALE_MS";
/// First lock retry delay in milliseconds
pub const ENV_LOCK_BASE_DELAY_MS: &str = "CHAINREPLAY_LOCK_BASE_DELAY_MS";
/// Lock retry delay multiplier
pub const ENV_LOCK_BACKOFF: &str = "CHAINREPLAY_LOCK_BACKOFF";
/// Lock retry delay ceiling in milliseconds
pub const ENV_LOCK_MAX_DELAY_MS: &str = "CHAINREPLAY_LOCK_MAX_DELAY_MS";
/// Lock retry jitter bound in milliseconds
pub const ENV_LOCK_JITTER_MS: &str = "CHAINREPLAY_LOCK_JITTER_MS";

/// What a recorder does with the batches it is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Persist every batch
    Record,
    /// Read-only; recording calls are no-ops
    Replay,
    /// Disabled
    #[default]
    Off,
}

impl Mode {
    /// Whether batches are persisted in this mode
    #[must_use]
    pub const fn is_recording(self) -> bool {
        matches!(self, Self::Record)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Replay => "replay",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record" => Ok(Self::Record),
            "replay" => Ok(Self::Replay),
            "off" | "" => Ok(Self::Off),
            other => Err(Error::configuration(format!(
                "invalid mode `{other}`, expected record, replay or off"
            ))),
        }
    }
}

/// Resolved cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Root directory holding every namespace
    pub root: PathBuf,
    /// Default recorder mode
    pub mode: Mode,
    /// Substitute live batches with cached data when possible
    pub auto_use: bool,
    /// Only substitute when the cached data covers the whole live range
    pub require_full_coverage: bool,
    /// Manifest lock timing
    pub lock: LockOptions,
    /// Log verbosity requested through the environment
    pub log_level: Option<String>,
}

impl CacheConfig {
    /// Configuration with defaults rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mode: Mode::default(),
            auto_use: false,
            require_full_coverage: true,
            lock: LockOptions::default(),
            log_level: None,
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let root = cache_root_from_inputs(CacheInputs {
            cache_dir_override: get(ENV_CACHE_DIR).map(PathBuf::from),
            xdg_cache_home: get("XDG_CACHE_HOME").map(PathBuf::from),
            os_cache_dir: cache_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        })?;

        let mut config = Self::new(root);
        if let Some(mode) = get(ENV_MODE) {
            config.mode = mode.parse()?;
        }
        if let Some(v) = get(ENV_AUTO_USE) {
            config.auto_use = parse_bool(ENV_AUTO_USE, &v)?;
        }
        if let Some(v) = get(ENV_REQUIRE_FULL_COVERAGE) {
            config.require_full_coverage = parse_bool(ENV_REQUIRE_FULL_COVERAGE, &v)?;
        }
        config.log_level = get(ENV_LOG_LEVEL).map(|v| v.trim().to_ascii_lowercase());

        let lock = &mut config.lock;
        if let Some(v) = get(ENV_LOCK_TIMEOUT_MS) {
            lock.timeout = parse_millis(ENV_LOCK_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = get(ENV_LOCK_STALE_MS) {
            lock.stale_after = parse_millis(ENV_LOCK_STALE_MS, &v)?;
        }
        if let Some(v) = get(ENV_LOCK_BASE_DELAY_MS) {
            lock.base_delay = parse_millis(ENV_LOCK_BASE_DELAY_MS, &v)?;
        }
        if let Some(v) = get(ENV_LOCK_BACKOFF) {
            lock.backoff_factor = parse_factor(ENV_LOCK_BACKOFF, &v)?;
        }
        if let Some(v) = get(ENV_LOCK_MAX_DELAY_MS) {
            lock.max_delay = parse_millis(ENV_LOCK_MAX_DELAY_MS, &v)?;
        }
        if let Some(v) = get(ENV_LOCK_JITTER_MS) {
            lock.jitter = parse_millis(ENV_LOCK_JITTER_MS, &v)?;
        }

        Ok(config)
    }

    /// Override the cache root
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Override the default mode
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// Inputs for cache root resolution, separated from the environment for tests
#[derive(Debug, Clone, Default)]
pub struct CacheInputs {
    /// Explicit override (`CHAINREPLAY_CACHE_DIR`)
    pub cache_dir_override: Option<PathBuf>,
    /// `XDG_CACHE_HOME`
    pub xdg_cache_home: Option<PathBuf>,
    /// Platform cache directory
    pub os_cache_dir: Option<PathBuf>,
    /// User home directory
    pub home_dir: Option<PathBuf>,
    /// Temporary directory
    pub temp_dir: PathBuf,
}

/// Pick the first writable cache root
pub fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) CHAINREPLAY_CACHE_DIR
    // 2) XDG_CACHE_HOME/chainreplay
    // 3) OS cache dir/chainreplay
    // 4) ~/.chainreplay/cache
    // 5) TMPDIR/chainreplay/cache
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs
        .cache_dir_override
        .filter(|p| !p.as_os_str().is_empty())
    {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("chainreplay"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("chainreplay"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".chainreplay/cache"));
    }
    candidates.push(inputs.temp_dir.join("chainreplay/cache"));

    for path in candidates {
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        if path.exists() {
            if is_writable(&path) {
                return Ok(path);
            }
            tracing::debug!(path = %path.display(), "Cache root candidate not writable");
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

fn is_writable(dir: &std::path::Path) -> bool {
    let probe = dir.join(".write_probe");
    match std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Parse a boolean flag (`1/0/true/false/yes/no/on/off`)
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::configuration(format!(
            "{key}: expected a boolean, got `{other}`"
        ))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| {
            Error::configuration(format!(
                "{key}: expected a number of milliseconds, got `{value}`"
            ))
        })
}

fn parse_factor(key: &str, value: &str) -> Result<f64> {
    match value.trim().parse::<f64>() {
        Ok(f) if f.is_finite() && f >= 1.0 => Ok(f),
        _ => Err(Error::configuration(format!(
            "{key}: expected a number >= 1, got `{value}`"
        ))),
    }
}
