//! Allocator configuration
//!
//! Loaded from YAML; every section falls back to its defaults so a partial
//! file is enough.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Complete allocator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub allocation: AllocationSettings,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AllocatorConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: AllocatorConfig) {
        self.cluster.merge(other.cluster);
        self.allocation = other.allocation;
        self.scheduler.merge(other.scheduler);
        self.log.merge(other.log);
    }
}

/// Cluster identity and persistence location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: Self) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
        if !other.data_dir.as_os_str().is_empty() {
            self.data_dir = other.data_dir;
        }
    }
}

/// Which shards may be allocated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableAllocation {
    #[default]
    All,
    Primaries,
    NewPrimaries,
    None,
}

/// Which shards may be rebalanced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableRebalance {
    #[default]
    All,
    Primaries,
    Replicas,
    None,
}

/// How many discovered copies a legacy-mode primary needs before it is
/// allocated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InitialShardsRepr", into = "InitialShardsRepr")]
pub enum InitialShards {
    #[default]
    Quorum,
    QuorumMinusOne,
    Full,
    FullMinusOne,
    One,
    Count(u32),
}

impl InitialShards {
    /// Required copies for a shard with `replicas` replicas
    pub fn required(&self, replicas: u32) -> u32 {
        let copies = replicas + 1;
        let quorum = copies / 2 + 1;
        match self {
            InitialShards::Quorum => quorum,
            InitialShards::QuorumMinusOne => quorum.saturating_sub(1).max(1),
            InitialShards::Full => copies,
            InitialShards::FullMinusOne => replicas.max(1),
            InitialShards::One => 1,
            InitialShards::Count(n) => *n,
        }
    }
}

impl std::str::FromStr for InitialShards {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quorum" => Ok(InitialShards::Quorum),
            "quorum-1" | "half" => Ok(InitialShards::QuorumMinusOne),
            "full" | "all" => Ok(InitialShards::Full),
            "full-1" | "all-1" => Ok(InitialShards::FullMinusOne),
            "one" => Ok(InitialShards::One),
            other => other.parse::<u32>().map(InitialShards::Count).map_err(|_| {
                ConfigError::ParseError(format!("invalid initial_shards value [{}]", other))
            }),
        }
    }
}

impl std::fmt::Display for InitialShards {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialShards::Quorum => write!(f, "quorum"),
            InitialShards::QuorumMinusOne => write!(f, "quorum-1"),
            InitialShards::Full => write!(f, "full"),
            InitialShards::FullMinusOne => write!(f, "full-1"),
            InitialShards::One => write!(f, "one"),
            InitialShards::Count(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum InitialShardsRepr {
    Count(u32),
    Name(String),
}

impl TryFrom<InitialShardsRepr> for InitialShards {
    type Error = ConfigError;

    fn try_from(repr: InitialShardsRepr) -> Result<Self, Self::Error> {
        match repr {
            InitialShardsRepr::Count(n) => Ok(InitialShards::Count(n)),
            InitialShardsRepr::Name(name) => name.parse(),
        }
    }
}

impl From<InitialShards> for InitialShardsRepr {
    fn from(value: InitialShards) -> Self {
        match value {
            InitialShards::Count(n) => InitialShardsRepr::Count(n),
            other => InitialShardsRepr::Name(other.to_string()),
        }
    }
}

/// Settings handed to every decider and allocator at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSettings {
    /// Refuse two copies of a shard on nodes sharing a host
    #[serde(default)]
    pub same_host: bool,
    #[serde(default)]
    pub enable: EnableAllocation,
    #[serde(default)]
    pub rebalance_enable: EnableRebalance,
    #[serde(default = "default_concurrent_recoveries")]
    pub node_concurrent_incoming_recoveries: usize,
    #[serde(default = "default_concurrent_recoveries")]
    pub node_concurrent_outgoing_recoveries: usize,
    #[serde(default = "default_initial_primaries_recoveries")]
    pub node_initial_primaries_recoveries: usize,
    /// Failed allocations after which a copy is no longer retried
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub initial_shards: InitialShards,
    /// Among in-sync copies, pick the one that last served as primary
    #[serde(default = "default_true")]
    pub prefer_previous_primary: bool,
    /// Node attributes that must all match (`_id`, `_host`, `_ip` or a custom attribute)
    #[serde(default)]
    pub require: BTreeMap<String, String>,
    /// Node attributes of which at least one must match
    #[serde(default)]
    pub include: BTreeMap<String, String>,
    /// Node attributes of which none may match
    #[serde(default)]
    pub exclude: BTreeMap<String, String>,
    /// Spread copies of a shard across values of the `rack` node attribute
    #[serde(default)]
    pub rack_awareness: bool,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            same_host: false,
            enable: EnableAllocation::default(),
            rebalance_enable: EnableRebalance::default(),
            node_concurrent_incoming_recoveries: default_concurrent_recoveries(),
            node_concurrent_outgoing_recoveries: default_concurrent_recoveries(),
            node_initial_primaries_recoveries: default_initial_primaries_recoveries(),
            max_retries: default_max_retries(),
            initial_shards: InitialShards::default(),
            prefer_previous_primary: true,
            require: BTreeMap::new(),
            include: BTreeMap::new(),
            exclude: BTreeMap::new(),
            rack_awareness: false,
        }
    }
}

/// Background task cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_reroute_interval_secs")]
    pub reroute_interval_secs: u64,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reroute_interval_secs: default_reroute_interval_secs(),
            save_interval_secs: default_save_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    fn merge(&mut self, other: Self) {
        if other.reroute_interval_secs > 0 {
            self.reroute_interval_secs = other.reroute_interval_secs;
        }
        if other.save_interval_secs > 0 {
            self.save_interval_secs = other.save_interval_secs;
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "allocator-cluster".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/allocator")
}

fn default_concurrent_recoveries() -> usize {
    2
}

fn default_initial_primaries_recoveries() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_reroute_interval_secs() -> u64 {
    10
}

fn default_save_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}
