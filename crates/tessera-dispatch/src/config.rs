//! Dispatcher configuration.
//!
//! Configuration comes from CLI arguments with `TESSERA_*` environment
//! fallbacks, then defaults.
//!
//! # Example
//!
//! ```no_run
//! use tessera_dispatch::DispatcherConfig;
//!
//! let config = DispatcherConfig::from_args();
//! config.validate().expect("Invalid configuration");
//! println!("socket: {}", config.socket_path().display());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::ConfigError;

/// Dispatcher configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tessera-dispatcher",
    about = "Single-writer transaction coordinator for tessera block stores",
    version
)]
pub struct DispatcherConfig {
    /// Database directory holding the controlled files
    #[arg(long, env = "TESSERA_DB_DIR")]
    pub db_dir: PathBuf,

    /// Shared memory name; also names the socket and shadow files
    #[arg(long, env = "TESSERA_SHARED_NAME", default_value = "/tessera_dispatcher")]
    pub shared_name: String,

    /// Controlled store trunks, comma-separated
    #[arg(
        long,
        env = "TESSERA_CONTROLLED_FILES",
        value_delimiter = ',',
        default_value = "nodes,ways,relations"
    )]
    pub controlled_files: Vec<String>,

    /// Global space budget in bytes
    #[arg(long, env = "TESSERA_SPACE", default_value_t = 12 << 30)]
    pub space: u64,

    /// Global time budget in seconds
    #[arg(long, env = "TESSERA_TIME", default_value_t = 256 * 1024)]
    pub time: u32,

    /// Concurrent readers per client token, 0 disables
    #[arg(long, env = "TESSERA_RATE_LIMIT", default_value_t = 0)]
    pub rate_limit: u32,

    /// Liveness purge interval in milliseconds
    #[arg(long, env = "TESSERA_PURGE_INTERVAL_MS", default_value_t = 1000)]
    pub purge_interval_ms: u64,
}

impl DispatcherConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Configuration for `db_dir` with default budgets.
    pub fn new(db_dir: impl Into<PathBuf>, shared_name: impl Into<String>) -> Self {
        Self {
            db_dir: db_dir.into(),
            shared_name: shared_name.into(),
            controlled_files: vec!["nodes".into(), "ways".into(), "relations".into()],
            space: 12 << 30,
            time: 256 * 1024,
            rate_limit: 0,
            purge_interval_ms: 1000,
        }
    }

    /// Global limits handed to the governor.
    pub const fn limits(&self) -> GovernorLimits {
        GovernorLimits {
            space: self.space,
            time: self.time,
            rate_limit: self.rate_limit,
        }
    }

    /// Shared name without its leading slash.
    pub fn base_name(&self) -> &str {
        self.shared_name.trim_start_matches('/')
    }

    /// Unix socket the dispatcher listens on.
    pub fn socket_path(&self) -> PathBuf {
        crate::ipc::socket_path(&self.db_dir, &self.shared_name)
    }

    /// Base path of the shadow marker, lock and status files.
    pub fn shadow_name(&self) -> PathBuf {
        self.db_dir.join(format!("{}.shadow", self.base_name()))
    }

    /// Interval between liveness purges.
    pub const fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - the database directory does not exist
    /// - the shared name is empty or contains a slash after the first byte
    /// - a controlled trunk is empty or contains a path separator
    /// - a budget or the purge interval is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.db_dir.is_dir() {
            return Err(ConfigError::MissingRequired(format!(
                "database directory not found: {}",
                self.db_dir.display()
            )));
        }

        let base = self.base_name();
        if base.is_empty() || base.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "shared_name",
                reason: format!("'{}' is not a valid shared memory name", self.shared_name),
            });
        }

        if self.controlled_files.is_empty() {
            return Err(ConfigError::MissingRequired(
                "at least one controlled file".to_string(),
            ));
        }
        if let Some(bad) = self
            .controlled_files
            .iter()
            .find(|trunk| trunk.is_empty() || trunk.contains('/'))
        {
            return Err(ConfigError::InvalidValue {
                field: "controlled_files",
                reason: format!("'{bad}' is not a file trunk"),
            });
        }

        if self.space == 0 {
            return Err(ConfigError::InvalidValue {
                field: "space",
                reason: "must be positive".to_string(),
            });
        }
        if self.time == 0 {
            return Err(ConfigError::InvalidValue {
                field: "time",
                reason: "must be positive".to_string(),
            });
        }
        if self.purge_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "purge_interval_ms",
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}

/// Global admission budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    /// Space budget in bytes.
    pub space: u64,
    /// Time budget in seconds.
    pub time: u32,
    /// Concurrent readers per token, 0 disables rate limiting.
    pub rate_limit: u32,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self {
            space: 12 << 30,
            time: 256 * 1024,
            rate_limit: 0,
        }
    }
}

/// Client-side retry bound with a fixed sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub attempts: u32,
    /// Sleep between attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Policy with the given bound.
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Reader admission: up to five minutes of polling.
    pub const fn admission() -> Self {
        Self::new(300, Duration::from_secs(1))
    }

    /// Write lock acquisition.
    pub const fn write_lock() -> Self {
        Self::new(600, Duration::from_millis(500))
    }

    /// Waiting for a deferred commit.
    pub const fn commit() -> Self {
        Self::new(3600, Duration::from_secs(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(50, Duration::from_millis(100))
    }
}
