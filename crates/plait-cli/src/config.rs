//! Configuration system for the PLAIT CLI.

use plait_core::{PeerIdentity, RegistryConfig, Route, TunnelConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PLAIT configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Tunnel tunables
    #[serde(default)]
    pub tunnel: TunnelSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Application id carried in bootstrap payloads
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    /// Passphrase both peers derive the tunnel identity from
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// Bootstrap token presented to the serving peer
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,
    /// Forward relay envelopes for other peers
    #[serde(default)]
    pub relay: bool,
    /// Addresses offered to peers asking for access points
    #[serde(default)]
    pub advertise: Vec<String>,
    /// Tick interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Tunnel tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Connected links to aim for
    #[serde(default = "default_min_links")]
    pub min_links: usize,
    /// Connected links above which the slowest is dropped
    #[serde(default = "default_max_links")]
    pub max_links: usize,
    /// Message slice size in bytes
    #[serde(default = "default_message_slice")]
    pub message_slice_size: usize,
    /// File slice size in bytes
    #[serde(default = "default_file_slice")]
    pub file_slice_size: usize,
    /// Idle teardown in seconds; absent disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:40100".to_string()
}

fn default_app_id() -> u32 {
    1
}

fn default_passphrase() -> String {
    "plait".to_string()
}

fn default_bootstrap() -> String {
    "plait-cli".to_string()
}

fn default_tick_ms() -> u64 {
    10
}

fn default_min_links() -> usize {
    TunnelConfig::default().min_links
}

fn default_max_links() -> usize {
    TunnelConfig::default().max_links
}

fn default_message_slice() -> usize {
    TunnelConfig::default().message_slice_size
}

fn default_file_slice() -> usize {
    TunnelConfig::default().file_slice_size
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            app_id: default_app_id(),
            passphrase: default_passphrase(),
            bootstrap: default_bootstrap(),
            relay: false,
            advertise: Vec::new(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            min_links: default_min_links(),
            max_links: default_max_links(),
            message_slice_size: default_message_slice(),
            file_slice_size: default_file_slice(),
            idle_timeout_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("plait/config.toml")
    }

    /// Load config from `path`, falling back to defaults when the default
    /// path does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or an
    /// explicitly given file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if path == Self::default_path() {
            Ok(Self::default())
        } else {
            anyhow::bail!("config file not found: {}", path.display())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.node.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        for addr in &self.node.advertise {
            addr.parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("advertised address '{addr}' is not host:port"))?;
        }
        if self.node.passphrase.is_empty() {
            anyhow::bail!("passphrase must not be empty");
        }
        if self.node.tick_ms == 0 || self.node.tick_ms > 1_000 {
            anyhow::bail!("tick interval must be between 1 and 1000 ms");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.registry_config().validate()?;
        Ok(())
    }

    /// Tunnel identity shared with the peer
    #[must_use]
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::from_passphrase(&self.node.passphrase)
    }

    /// Engine configuration
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        let tunnel = TunnelConfig {
            min_links: self.tunnel.min_links,
            max_links: self.tunnel.max_links,
            message_slice_size: self.tunnel.message_slice_size,
            file_slice_size: self.tunnel.file_slice_size,
            idle_timeout: self.tunnel.idle_timeout_secs.map(Duration::from_secs),
            ..TunnelConfig::default()
        };
        RegistryConfig {
            tunnel,
            app_id: self.node.app_id,
            advertised_routes: self
                .node
                .advertise
                .iter()
                .filter_map(|a| a.parse().ok())
                .map(Route::direct)
                .collect(),
        }
    }
}
