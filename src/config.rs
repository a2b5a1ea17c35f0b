//! Configuration management for rpmirror

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem paths
    #[serde(default)]
    pub paths: PathsConfig,

    /// Upstream source handling
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Batch sizes, concurrency, timeouts
    #[serde(default)]
    pub tuning: TuningConfig,

    /// External command names
    #[serde(default)]
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the local mirror; one subdirectory per repository
    pub mirror_root: PathBuf,

    /// Cache directory for persisted upstream indexes
    pub cache_dir: PathBuf,

    /// Shared distribution path synced after a successful run
    #[serde(default)]
    pub share_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cache_dir = directories::ProjectDirs::from("org", "rpmirror", "rpmirror")
            .map(|d| d.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/var/cache/rpmirror"));

        Self {
            mirror_root: PathBuf::from("/srv/rpmirror"),
            cache_dir,
            share_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Upstream sources that are never mirrored even when enabled
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Manually tracked local sources (e.g. locally built RPMs). Packages
    /// whose recorded source matches one of these resolve without an
    /// upstream index entry.
    #[serde(default)]
    pub local_only: Vec<String>,

    /// Tie-break order when a signature is available from several sources
    #[serde(default)]
    pub priority: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Upstream index entries younger than this are reused without a query
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,

    /// Packages per download batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent fetch/delete operations
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Retries per package after the first failed attempt
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Timeout for one upstream metadata query
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Timeout for one package download
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Ceiling for one whole download batch
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Timeout for one metadata regeneration
    #[serde(default = "default_regen_timeout")]
    pub regen_timeout_secs: u64,

    /// Timeout for the final distribution sync
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

fn default_freshness_secs() -> u64 {
    14400
}

fn default_batch_size() -> usize {
    50
}

fn default_parallelism() -> usize {
    6
}

fn default_retries() -> u32 {
    2
}

fn default_query_timeout() -> u64 {
    600
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_batch_timeout() -> u64 {
    1800
}

fn default_regen_timeout() -> u64 {
    1800
}

fn default_publish_timeout() -> u64 {
    3600
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
            batch_size: default_batch_size(),
            parallelism: default_parallelism(),
            retries: default_retries(),
            query_timeout_secs: default_query_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            batch_timeout_secs: default_batch_timeout(),
            regen_timeout_secs: default_regen_timeout(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Package manager used for queries and downloads
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    /// Repository metadata generator
    #[serde(default = "default_metadata_tool")]
    pub metadata_tool: String,

    /// Distribution sync tool
    #[serde(default = "default_rsync")]
    pub rsync: String,
}

fn default_package_manager() -> String {
    "dnf".to_string()
}

fn default_metadata_tool() -> String {
    "createrepo_c".to_string()
}

fn default_rsync() -> String {
    "rsync".to_string()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            package_manager: default_package_manager(),
            metadata_tool: default_metadata_tool(),
            rsync: default_rsync(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            sources: SourcesConfig::default(),
            tuning: TuningConfig::default(),
            commands: CommandsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(|| {
                // Try system config
                let system_config = PathBuf::from("/etc/rpmirror/rpmirror.conf");
                if system_config.exists() {
                    return Some(system_config);
                }

                // Try user config
                directories::ProjectDirs::from("org", "rpmirror", "rpmirror")
                    .map(|d| d.config_dir().join("rpmirror.conf"))
                    .filter(|p| p.exists())
            });

        match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }

    /// Check the invariants a run cannot start without. The mirror root
    /// must exist and be a directory; everything else is created on demand.
    pub fn validate(&self) -> std::result::Result<(), MirrorError> {
        if !self.paths.mirror_root.is_dir() {
            return Err(MirrorError::MirrorRootInaccessible(
                self.paths.mirror_root.display().to_string(),
            ));
        }
        if self.tuning.parallelism == 0 || self.tuning.batch_size == 0 {
            return Err(MirrorError::Config(
                "parallelism and batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding persisted upstream index entries
    pub fn index_cache_dir(&self) -> PathBuf {
        self.paths.cache_dir.join("index")
    }
}
