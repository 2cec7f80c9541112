//! Rebalancer configuration
//!
//! Configuration loaded from a TOML file, environment variables and command
//! line overrides. Every component takes what it needs from [`CoreConfig`];
//! nothing reads process-wide state.

use arrayshift_core::{parse_size, RsyncMode, Strategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 1 GiB safety reserve kept free on every destination disk.
pub const DEFAULT_RESERVE_BYTES: u64 = 1024 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Complete rebalancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Directory the data disks are mounted under
    #[serde(default = "default_mount_prefix")]
    pub mount_prefix: PathBuf,

    /// Anchored regex a directory name must match to count as a data disk
    #[serde(default = "default_disk_name_pattern")]
    pub disk_name_pattern: String,

    /// Target maximum fill percent per disk; negative means auto-even
    #[serde(default = "default_target_percent")]
    pub target_percent: f64,

    /// Headroom percent kept free when auto-evening
    #[serde(default = "default_headroom_percent")]
    pub headroom_percent: f64,

    /// Unit-selection strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Rsync performance mode
    #[serde(default)]
    pub rsync_mode: RsyncMode,

    /// Allocation unit depth below each share root (0 = whole share)
    #[serde(default = "default_unit_depth")]
    pub unit_depth: usize,

    /// Only move units at least this large
    #[serde(default = "default_min_unit_size")]
    pub min_unit_size: u64,

    /// Disk names to include (empty = all)
    #[serde(default)]
    pub include_disks: Vec<String>,

    /// Disk names to exclude
    #[serde(default)]
    pub exclude_disks: Vec<String>,

    /// Share names to include (empty = all)
    #[serde(default)]
    pub include_shares: Vec<String>,

    /// Share names to exclude
    #[serde(default)]
    pub exclude_shares: Vec<String>,

    /// Globs matched against `share/rel_path`; matching units are skipped
    #[serde(default)]
    pub exclude_globs: Vec<String>,

    /// Path or name of the rsync executable
    #[serde(default = "default_rsync_path")]
    pub rsync_path: String,

    /// Extra flags appended verbatim to every rsync invocation
    #[serde(default)]
    pub rsync_extra: Vec<String>,

    /// Merge into an existing destination directory instead of failing the move
    #[serde(default)]
    pub allow_merge: bool,

    /// Directory for the transfer journal
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Safety reserve per destination disk in bytes
    #[serde(default = "default_reserve_bytes")]
    pub reserve_bytes: u64,

    /// Soft timeout per move in seconds
    #[serde(default = "default_move_timeout_secs")]
    pub move_timeout_secs: u64,

    /// Maximum concurrent moves (0 = half the disk count)
    #[serde(default)]
    pub max_parallel: usize,

    /// Maximum retry attempts per move for recoverable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Days to keep completed journal records
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mount_prefix: default_mount_prefix(),
            disk_name_pattern: default_disk_name_pattern(),
            target_percent: default_target_percent(),
            headroom_percent: default_headroom_percent(),
            strategy: Strategy::default(),
            rsync_mode: RsyncMode::default(),
            unit_depth: default_unit_depth(),
            min_unit_size: default_min_unit_size(),
            include_disks: Vec::new(),
            exclude_disks: Vec::new(),
            include_shares: Vec::new(),
            exclude_shares: Vec::new(),
            exclude_globs: Vec::new(),
            rsync_path: default_rsync_path(),
            rsync_extra: Vec::new(),
            allow_merge: false,
            state_dir: default_state_dir(),
            reserve_bytes: default_reserve_bytes(),
            move_timeout_secs: default_move_timeout_secs(),
            max_parallel: 0,
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(prefix) = std::env::var("ARRAYSHIFT_MOUNT_PREFIX") {
            self.mount_prefix = PathBuf::from(prefix);
        }
        if let Ok(dir) = std::env::var("ARRAYSHIFT_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("ARRAYSHIFT_RSYNC") {
            self.rsync_path = path;
        }
        if let Ok(size) = std::env::var("ARRAYSHIFT_MIN_UNIT_SIZE") {
            if let Ok(bytes) = parse_size(&size) {
                self.min_unit_size = bytes;
            }
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_percent > 100.0 {
            return Err(ConfigError::InvalidValue(
                "target_percent",
                format!("{} exceeds 100", self.target_percent),
            ));
        }
        if self.headroom_percent < 0.0 || self.headroom_percent >= 100.0 {
            return Err(ConfigError::InvalidValue(
                "headroom_percent",
                format!("{} not in [0, 100)", self.headroom_percent),
            ));
        }
        if self.move_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "move_timeout_secs",
                "must be positive".to_string(),
            ));
        }
        // An include list fully swallowed by the exclude list leaves nothing
        // to operate on, which is a contradiction rather than an empty run.
        if !self.include_disks.is_empty()
            && self
                .include_disks
                .iter()
                .all(|d| self.exclude_disks.contains(d))
        {
            return Err(ConfigError::InvalidValue(
                "include_disks",
                "every included disk is also excluded".to_string(),
            ));
        }
        if !self.include_shares.is_empty()
            && self
                .include_shares
                .iter()
                .all(|s| self.exclude_shares.contains(s))
        {
            return Err(ConfigError::InvalidValue(
                "include_shares",
                "every included share is also excluded".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the planner runs in auto-even mode.
    pub fn auto_target(&self) -> bool {
        self.target_percent < 0.0
    }

    /// Soft timeout per move as a Duration.
    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_secs)
    }

    /// Retention threshold for completed journal records.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    /// Effective worker pool size for the given disk count.
    pub fn pool_size(&self, disk_count: usize) -> usize {
        let cap = (disk_count / 2).max(1);
        if self.max_parallel == 0 {
            cap
        } else {
            self.max_parallel.min(cap)
        }
    }
}

fn default_mount_prefix() -> PathBuf {
    PathBuf::from("/mnt")
}

fn default_disk_name_pattern() -> String {
    "^disk[0-9]+$".to_string()
}

fn default_target_percent() -> f64 {
    80.0
}

fn default_headroom_percent() -> f64 {
    5.0
}

fn default_unit_depth() -> usize {
    1
}

fn default_min_unit_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_rsync_path() -> String {
    "rsync".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/arrayshift")
}

fn default_reserve_bytes() -> u64 {
    DEFAULT_RESERVE_BYTES
}

fn default_move_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_days() -> u64 {
    7
}
