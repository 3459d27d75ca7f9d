//! Node configuration
//!
//! Defaults can be overridden by a JSON file and then by command-line flags.
//! Interval fields are in seconds.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// P2P node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Seed for a deterministic peer id; random when unset
    pub seed: Option<u64>,
    /// Hardcoded seed peers (`<peer-id>@<ip>:<port>`)
    pub bootstrap_nodes: Vec<String>,
    pub dev_mode: bool,
    /// Relaxes address routability checks and forces self-advertisement
    pub test_mode: bool,
    pub get_addr_interval: u64,
    pub ping_interval: u64,
    pub self_adv_interval: u64,
    pub clean_up_interval: u64,
    /// Connection-establishment sweep interval
    pub conn_est_interval: u64,
    /// Largest Addr message accepted from a peer
    pub max_addrs_expected: usize,
    pub max_inbound_connections: usize,
    pub max_outbound_connections: usize,
    /// Dial and per-message read/write timeout
    pub message_timeout: u64,
    /// How long a picked broadcaster set is reused
    pub broadcaster_cache_ttl: u64,
    /// Data directory for peer persistence
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            seed: None,
            bootstrap_nodes: Vec::new(),
            dev_mode: false,
            test_mode: false,
            get_addr_interval: 1800,
            ping_interval: 1800,
            self_adv_interval: 1800,
            clean_up_interval: 600,
            conn_est_interval: 600,
            max_addrs_expected: 1000,
            max_inbound_connections: 115,
            max_outbound_connections: 10,
            message_timeout: 30,
            broadcaster_cache_ttl: 86_400,
            data_dir: PathBuf::from(".gossip_data"),
        }
    }
}

impl NodeConfig {
    /// Load a config file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("get_addr_interval", self.get_addr_interval),
            ("ping_interval", self.ping_interval),
            ("self_adv_interval", self.self_adv_interval),
            ("clean_up_interval", self.clean_up_interval),
            ("conn_est_interval", self.conn_est_interval),
            ("message_timeout", self.message_timeout),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be positive", name)));
            }
        }
        if self.max_addrs_expected == 0 {
            return Err(ConfigError::InvalidValue(
                "max_addrs_expected must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Production mode is neither dev nor test
    pub fn is_prod_mode(&self) -> bool {
        !self.dev_mode && !self.test_mode
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout)
    }

    pub fn get_addr_interval(&self) -> Duration {
        Duration::from_secs(self.get_addr_interval)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn self_adv_interval(&self) -> Duration {
        Duration::from_secs(self.self_adv_interval)
    }

    pub fn clean_up_interval(&self) -> Duration {
        Duration::from_secs(self.clean_up_interval)
    }

    pub fn conn_est_interval(&self) -> Duration {
        Duration::from_secs(self.conn_est_interval)
    }

    pub fn broadcaster_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.broadcaster_cache_ttl as i64)
    }
}
