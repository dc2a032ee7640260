//! Configuration management for the backup agent.
//!
//! Loads configuration from a TOML file. Every field has a default, so a
//! partial file (or none at all) is valid.

use crate::executor::retry::RetryPolicy;
use crate::executor::DumpOptions;
use crate::repository::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent identifier
    #[serde(default = "default_agent_id")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Hypervisor gateway URL
    #[serde(default = "default_endpoint_url")]
    pub url: String,

    /// Bearer token
    #[serde(default)]
    pub token: String,

    /// Timeout of a single request in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Where dumped extents are written
    #[serde(default = "default_repository_root")]
    pub root: PathBuf,

    /// Where checkpoint records are kept
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_compression")]
    pub compression: Compression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Maximum concurrent extent transfers per operation
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Largest single read in bytes (default: 4MB)
    #[serde(default = "default_max_io_size")]
    pub max_io_size: u64,

    /// Attempts per extent and per remote call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Seconds between two progress lines of the same disk
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Take a fresh snapshot before each backup
    #[serde(default)]
    pub create: bool,

    /// Remove the snapshot taken by the agent after a successful backup
    #[serde(default = "default_true")]
    pub remove_after: bool,

    /// Name prefix of snapshots taken by the agent
    #[serde(default = "default_snapshot_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "blockdump-agent-01".to_string())
}

fn default_endpoint_url() -> String {
    "http://localhost:8443".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_repository_root() -> PathBuf {
    PathBuf::from("/var/lib/blockdump/blocks")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/blockdump/checkpoints")
}

fn default_compression() -> Compression {
    Compression::Zstd(3)
}

fn default_concurrency() -> usize {
    4
}

fn default_max_io_size() -> u64 {
    4 * 1024 * 1024 // 4MB
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_progress_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_snapshot_prefix() -> String {
    "blockdump".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { id: default_agent_id() }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            token: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: default_repository_root(),
            checkpoint_dir: default_checkpoint_dir(),
            compression: default_compression(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_io_size: default_max_io_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            create: false,
            remove_after: default_true(),
            prefix: default_snapshot_prefix(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent: AgentConfig::default(),
            endpoint: EndpointConfig::default(),
            repository: RepositoryConfig::default(),
            dump: DumpConfig::default(),
            snapshot: SnapshotConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dump.concurrency == 0 {
            anyhow::bail!("dump.concurrency must be at least 1");
        }
        if self.dump.max_io_size == 0 {
            anyhow::bail!("dump.max_io_size must be at least 1");
        }
        if self.dump.max_attempts == 0 {
            anyhow::bail!("dump.max_attempts must be at least 1");
        }
        if let Compression::Zstd(level) = self.repository.compression {
            if !(1..=22).contains(&level) {
                anyhow::bail!("zstd level {} out of range 1-22", level);
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dump.max_attempts,
            initial_backoff: Duration::from_millis(self.dump.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.dump.max_backoff_ms),
        }
    }

    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint.timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.dump.progress_interval_secs)
    }

    pub fn dump_options(&self) -> DumpOptions {
        DumpOptions {
            concurrency: self.dump.concurrency,
            max_io_size: self.dump.max_io_size,
            retry: self.retry_policy(),
            create_snapshot: self.snapshot.create,
            remove_snapshot_after: self.snapshot.remove_after,
            snapshot_prefix: self.snapshot.prefix.clone(),
        }
    }
}
