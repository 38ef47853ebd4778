use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;
use tracing::debug;

use crate::error::{KvError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local UDP listening address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Address other members use to reach this node, when it differs from `bind_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    /// Static membership. The local node is always placed even if absent here.
    #[serde(default)]
    pub nodes: Vec<SocketAddr>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub overload: OverloadConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of nodes holding each key, identical on every member
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    #[serde(default = "default_checkup_interval")]
    pub checkup_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Requests handled concurrently before answering SYSTEM_OVERLOAD
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Receive timeout, bounds how long shutdown waits on the socket
    #[serde(default = "default_receive_poll")]
    pub receive_poll_ms: u64,
    #[serde(default = "default_store_capacity")]
    pub store_capacity_bytes: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Period between heartbeat pushes to one random member
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
    /// Silent rounds before a member is considered failed
    #[serde(default = "default_failure_rounds")]
    pub failure_rounds: u64,
    /// Further silent rounds before a failed member leaves the ring
    #[serde(default = "default_removal_rounds")]
    pub removal_rounds: u64,
    /// Keys handed over before pausing during migration
    #[serde(default = "default_migration_batch")]
    pub migration_batch: usize,
    #[serde(default = "default_migration_pause")]
    pub migration_pause_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverloadConfig {
    #[serde(default = "default_overload_initial")]
    pub initial_wait_ms: u64,
    #[serde(default = "default_overload_max")]
    pub max_wait_ms: u64,
    /// Overloaded responses inside one window before the wait doubles
    #[serde(default = "default_overload_limit")]
    pub response_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_initial_timeout")]
    pub initial_timeout_ms: u64,
    #[serde(default = "default_client_max_timeout")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_client_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily JSON log files. Console only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            nodes: Vec::new(),
            cluster: ClusterConfig::default(),
            server: ServerSettings::default(),
            membership: MembershipConfig::default(),
            overload: OverloadConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            virtual_nodes: default_virtual_nodes(),
            checkup_interval_ms: default_checkup_interval(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            receive_poll_ms: default_receive_poll(),
            store_capacity_bytes: default_store_capacity(),
            cache_ttl_ms: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: default_gossip_interval(),
            failure_rounds: default_failure_rounds(),
            removal_rounds: default_removal_rounds(),
            migration_batch: default_migration_batch(),
            migration_pause_ms: default_migration_pause(),
        }
    }
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            initial_wait_ms: default_overload_initial(),
            max_wait_ms: default_overload_max(),
            response_limit: default_overload_limit(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: default_client_initial_timeout(),
            max_timeout_ms: default_client_max_timeout(),
            max_retries: default_client_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

// Default value functions
fn default_bind_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 5000)) }
fn default_replication_factor() -> usize { 3 }
fn default_virtual_nodes() -> u32 { 10 }
fn default_checkup_interval() -> u64 { 300_000 }
fn default_max_inflight() -> usize { 256 }
fn default_receive_poll() -> u64 { 500 }
fn default_store_capacity() -> usize { 40 * 1024 * 1024 }
fn default_cache_ttl() -> u64 { 5_000 }
fn default_cache_max_entries() -> usize { 100_000 }
fn default_gossip_interval() -> u64 { 2_000 }
fn default_failure_rounds() -> u64 { 16 }
fn default_removal_rounds() -> u64 { 8 }
fn default_migration_batch() -> usize { 100 }
fn default_migration_pause() -> u64 { 100 }
fn default_overload_initial() -> u64 { 100 }
fn default_overload_max() -> u64 { 5_000 }
fn default_overload_limit() -> u32 { 5 }
fn default_client_initial_timeout() -> u64 { 100 }
fn default_client_max_timeout() -> u64 { 3_200 }
fn default_client_retries() -> u32 { 3 }
fn default_log_level() -> String { "info".to_string() }

impl NodeConfig {
    /// Load and validate configuration from a YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| KvError::config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| KvError::config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;

        debug!(path = %path.display(), members = config.nodes.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.replication_factor == 0 {
            return Err(KvError::config("replication_factor must be at least 1"));
        }
        if self.cluster.virtual_nodes == 0 {
            return Err(KvError::config("virtual_nodes must be at least 1"));
        }
        if self.cluster.checkup_interval_ms == 0 {
            return Err(KvError::config("checkup_interval_ms must be positive"));
        }
        if self.server.max_inflight == 0 {
            return Err(KvError::config("max_inflight must be at least 1"));
        }
        if self.server.receive_poll_ms == 0 {
            return Err(KvError::config("receive_poll_ms must be positive"));
        }
        if self.server.cache_ttl_ms == 0 {
            return Err(KvError::config("cache_ttl_ms must be positive"));
        }
        if self.server.cache_max_entries == 0 {
            return Err(KvError::config("cache_max_entries must be at least 1"));
        }
        if self.membership.gossip_interval_ms == 0 {
            return Err(KvError::config("gossip_interval_ms must be positive"));
        }
        if self.membership.failure_rounds == 0 {
            return Err(KvError::config("failure_rounds must be at least 1"));
        }
        if self.membership.migration_batch == 0 {
            return Err(KvError::config("migration_batch must be at least 1"));
        }
        if self.overload.initial_wait_ms == 0 || self.overload.max_wait_ms < self.overload.initial_wait_ms {
            return Err(KvError::config("overload wait-times must satisfy 0 < initial_wait_ms <= max_wait_ms"));
        }
        if self.client.initial_timeout_ms == 0 || self.client.max_timeout_ms < self.client.initial_timeout_ms {
            return Err(KvError::config("client timeouts must satisfy 0 < initial_timeout_ms <= max_timeout_ms"));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| KvError::config(format!("Failed to serialize config: {}", e)))?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KvError::config(format!("Failed to create config directory: {}", e)))?;
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)
            .map_err(|e| KvError::config(format!("Failed to write config: {}", e)))?;

        fs::rename(&temp_path, path)
            .map_err(|e| KvError::config(format!("Failed to save config: {}", e)))?;

        Ok(())
    }
}

impl ClusterConfig {
    pub fn checkup_interval(&self) -> Duration {
        Duration::from_millis(self.checkup_interval_ms)
    }
}

impl ServerSettings {
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl MembershipConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn migration_pause(&self) -> Duration {
        Duration::from_millis(self.migration_pause_ms)
    }
}

impl ClientConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.cluster.replication_factor, 3);
        assert_eq!(config.cluster.virtual_nodes, 10);
        assert_eq!(config.cluster.checkup_interval_ms, 300_000);
        assert_eq!(config.server.store_capacity_bytes, 40 * 1024 * 1024);
        assert_eq!(config.overload.response_limit, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "bind_addr: 127.0.0.1:6000\ncluster:\n  replication_factor: 2\n";
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_addr.port(), 6000);
        assert_eq!(config.cluster.replication_factor, 2);
        assert_eq!(config.cluster.virtual_nodes, 10);
        assert_eq!(config.client.max_retries, 3);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("node.yml");

        let mut config = NodeConfig::default();
        config.nodes = vec!["127.0.0.1:5001".parse().unwrap(), "127.0.0.1:5002".parse().unwrap()];
        config.logging.directory = Some(dir.path().join("logs"));
        config.save(&path).unwrap();

        let loaded = NodeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.nodes, config.nodes);
        assert_eq!(loaded.logging.directory, config.logging.directory);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = NodeConfig::default();
        config.cluster.replication_factor = 0;
        assert!(matches!(config.validate(), Err(KvError::Config(_))));

        let mut config = NodeConfig::default();
        config.cluster.virtual_nodes = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.overload.max_wait_ms = 10;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.membership.gossip_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparsable_address_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yml");
        fs::write(&path, "nodes:\n  - not-an-address\n").unwrap();
        assert!(matches!(NodeConfig::load_from_file(&path), Err(KvError::Config(_))));
    }
}
