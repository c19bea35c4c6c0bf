use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub traversal: TraversalConfig,
}

/// Where objects and the index database live
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Root directory of the filesystem object store (one sub-directory per object).
    pub objects_dir: PathBuf,
    /// SQLite database shared by every process: processing index and lock table.
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Lock manager tuning
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Maximum time to wait for a read or write lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease after which a lock left by a dead process is reclaimed.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Processing index tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Number of rebuilds between commits during a full re-index.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_rows")]
    pub default_rows: usize,
    /// Datastream holding Dublin Core descriptive metadata.
    #[serde(default = "default_title_datastream")]
    pub title_datastream: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            default_rows: default_rows(),
            title_datastream: default_title_datastream(),
        }
    }
}

/// Traversal configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TraversalConfig {
    /// Datastream whose presence makes an object viewable.
    #[serde(default = "default_viewable_datastream")]
    pub viewable_datastream: String,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            viewable_datastream: default_viewable_datastream(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_lease_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    100
}

fn default_rows() -> usize {
    100
}

fn default_title_datastream() -> String {
    "DC".to_string()
}

fn default_viewable_datastream() -> String {
    "IMG_FULL".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in GRAPHREPO_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("GRAPHREPO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::from_file(&config_path)
    }

    /// Load and validate a specific config file
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if !self.repository.objects_dir.exists() {
            anyhow::bail!(
                "objects_dir path does not exist: {}. Set objects_dir in config.toml to your object store.",
                self.repository.objects_dir.display()
            );
        }

        if !self.repository.objects_dir.is_dir() {
            anyhow::bail!(
                "objects_dir must be a directory, not a file: {}",
                self.repository.objects_dir.display()
            );
        }

        if self.locks.timeout_ms == 0 {
            anyhow::bail!("locks.timeout_ms must be greater than 0");
        }

        if self.locks.poll_interval_ms == 0 || self.locks.poll_interval_ms > self.locks.timeout_ms {
            anyhow::bail!("locks.poll_interval_ms must be between 1 and locks.timeout_ms");
        }

        if self.locks.lease_secs == 0 {
            anyhow::bail!("locks.lease_secs must be greater than 0");
        }

        if self.index.batch_size == 0 {
            anyhow::bail!("index.batch_size must be greater than 0");
        }

        if self.index.default_rows == 0 {
            anyhow::bail!("index.default_rows must be greater than 0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.repository.db_path
    }

    /// Get the object store root
    pub fn objects_dir(&self) -> &Path {
        &self.repository.objects_dir
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.repository.migrations_dir
    }
}
