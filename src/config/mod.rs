use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for a corrald cluster member.
///
/// This structure defines all the configurable parameters for one daemon
/// process: its identity within the cluster, the REST listener, the storage
/// pools it serves, and the cluster-wide timing knobs the relocation and
/// snapshot engines consume. It supports serialization to and deserialization
/// from JSON for persistent configuration.
///
/// The configuration can be loaded from a file or generated with default
/// values if no configuration file exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Cluster-unique name of this member
    pub name: String,

    /// The IP address to which the REST listener will bind
    pub address: String,

    /// The port number on which the REST listener will listen
    pub port: u16,

    /// Address other members use to reach this one, `host:port`
    pub cluster_address: String,

    /// Architecture this member runs instances for (e.g. `x86_64`)
    pub architecture: String,

    /// Failover group this member belongs to
    pub member_group: String,

    /// Seconds without a heartbeat before a member counts as offline
    pub offline_threshold_secs: u64,

    /// Seconds between heartbeat rows written by this member
    pub heartbeat_interval_secs: u64,

    /// Default timeout when stopping an instance ahead of a stateless move
    pub stop_timeout_secs: u64,

    /// Storage pools served by this member
    pub pools: Vec<PoolConfig>,
}

/// One storage pool definition.
///
/// The driver name selects the pool backend; `remote` drivers expose the same
/// content from every member and need no data movement on relocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name, single path segment
    pub name: String,

    /// Driver name, `dir` or `shared`
    pub driver: String,

    /// Filesystem root the driver stores volumes under
    pub source: String,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            name: "node-a".to_string(),
            address: "127.0.0.1".to_string(),
            port: 8443,
            cluster_address: "127.0.0.1:8443".to_string(),
            architecture: "x86_64".to_string(),
            member_group: "default".to_string(),
            offline_threshold_secs: 20,
            heartbeat_interval_secs: 5,
            stop_timeout_secs: 30,
            pools: vec![PoolConfig {
                name: "local".to_string(),
                driver: "dir".to_string(),
                source: "/var/lib/corral/storage-pools/local".to_string(),
            }],
        }
    }
}

/// Possible errors that can occur during configuration operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    /// Indicates that the configuration file could not be found
    FileNotFound,

    /// Indicates that writing to the configuration file failed
    FailedToWrite,

    /// Indicates that parsing the configuration file content failed
    ParseError,
}

/// Global static reference to the member configuration.
///
/// Initialized when first accessed, reading from the configuration file or
/// creating default settings if no configuration exists.
///
/// # Panics
///
/// Panics if the configuration cannot be read or written, which would
/// prevent the daemon from starting properly.
lazy_static! {
    pub static ref MEMBER_CONFIG: Arc<MemberConfig> =
        Arc::new(MemberConfig::read().expect("Failed to initialize member config"));
}

impl MemberConfig {
    /// Reads the member configuration from the config file.
    ///
    /// Attempts to load the configuration from "config.json" in the current
    /// directory. If the file doesn't exist or can't be read, it creates a new
    /// configuration file with default values and returns those defaults.
    pub fn read() -> Result<Self, ConfigError> {
        let config_path = "config.json";
        let config_content = match std::fs::read_to_string(config_path) {
            Ok(content) => content,
            Err(_) => {
                // If file doesn't exist, create a default configuration
                Self::write_default().expect("Failed to write default config");
                return Ok(MemberConfig::default());
            }
        };

        let config: MemberConfig = match serde_json::from_str(&config_content) {
            Ok(config) => config,
            Err(_) => return Err(ConfigError::ParseError),
        };

        Ok(config)
    }

    /// Writes the current configuration to the config file.
    pub fn write(&self) -> Result<(), ConfigError> {
        let config_path = "config.json";

        let config_content = match serde_json::to_string_pretty(&self) {
            Ok(content) => content,
            Err(_) => return Err(ConfigError::ParseError),
        };

        match std::fs::write(config_path, config_content) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::FailedToWrite),
        }
    }

    /// Creates and writes a default configuration to the config file.
    pub fn write_default() -> Result<(), ConfigError> {
        let config = MemberConfig::default();
        config.write()
    }

    /// Offline threshold as a chrono duration, for heartbeat comparisons.
    pub fn offline_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_threshold_secs as i64)
    }
}
