use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire protocol constants
pub mod protocol {
    /// Port the directory (lookup) service listens on
    pub const LOOKUP_PORT: u16 = 56732;

    /// Port each peer's messaging service listens on
    pub const PEER_PORT: u16 = 47906;

    /// Server name presented in TLS handshakes. Certificates are never
    /// validated against it.
    pub const TLS_SERVER_NAME: &str = "peerchat.local";

    /// Longest directory request or response line, terminator excluded
    pub const MAX_DIRECTORY_FRAME: usize = 64;

    /// Longest chat message line, terminator excluded
    pub const MAX_MESSAGE_FRAME: usize = 4096;

    /// How long an accept loop waits before re-checking the shutdown flag
    pub const ACCEPT_POLL_INTERVAL_MS: u64 = 200;

    /// Handshake plus request/response budget for one connection
    pub const IO_TIMEOUT_SECS: u64 = 10;
}

/// Address table sizing constants
pub mod table {
    /// Capacity of a freshly created table
    pub const INITIAL_CAPACITY: usize = 32;

    /// Hard capacity limit; growth stops here (2^20)
    pub const MAX_CAPACITY: usize = 1 << 20;

    /// Table grows before an insert would reach this load
    pub const LOAD_FACTOR: f64 = 0.67;

    /// Capacity multiplier applied on growth
    pub const GROWTH_FACTOR: usize = 2;
}

/// File names inside a data directory
pub mod files {
    pub const CERT_FILE: &str = "cert.pem";
    pub const KEY_FILE: &str = "key.pem";
    pub const TABLE_FILE: &str = "lookup.table";
    pub const PINS_FILE: &str = "lookup-pins.json";
    pub const HISTORY_FILE: &str = "history.json";
}

/// Directory (lookup) server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Listen address
    pub listen_addr: IpAddr,

    /// Listen port
    pub listen_port: u16,

    /// Data directory holding the identity, table and pin files
    pub data_dir: PathBuf,

    /// Capacity of an empty table
    pub initial_capacity: usize,

    /// Hard capacity limit
    pub max_capacity: usize,

    /// Pin the client certificate of each username on its first Update
    pub pin_updates: bool,

    /// Accept loop poll interval in milliseconds
    pub accept_poll_ms: u64,

    /// Per-connection timeout in seconds
    pub io_timeout_secs: u64,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            listen_port: protocol::LOOKUP_PORT,
            data_dir: default_data_dir(".peerchat-lookup"),
            initial_capacity: table::INITIAL_CAPACITY,
            max_capacity: table::MAX_CAPACITY,
            pin_updates: true,
            accept_poll_ms: protocol::ACCEPT_POLL_INTERVAL_MS,
            io_timeout_secs: protocol::IO_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

impl DirectoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen(mut self, addr: IpAddr, port: u16) -> Self {
        self.listen_addr = addr;
        self.listen_port = port;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_capacity_limits(mut self, initial: usize, max: usize) -> Self {
        self.initial_capacity = initial;
        self.max_capacity = max;
        self
    }

    pub fn with_pin_updates(mut self, pin: bool) -> Self {
        self.pin_updates = pin;
        self
    }

    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn table_path(&self) -> PathBuf {
        self.data_dir.join(files::TABLE_FILE)
    }

    pub fn pins_path(&self) -> PathBuf {
        self.data_dir.join(files::PINS_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join(files::CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(files::KEY_FILE)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Check that the capacity limits are usable by the address table
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = |n: usize| n.is_power_of_two() && n >= 2;
        if !valid(self.initial_capacity) || !valid(self.max_capacity) {
            return Err(ConfigError::Invalid(
                "table capacities must be powers of two".to_string(),
            ));
        }
        if self.initial_capacity > self.max_capacity {
            return Err(ConfigError::Invalid(
                "initial capacity exceeds max capacity".to_string(),
            ));
        }
        if self.accept_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "accept poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(self, path)
    }
}

/// Peer (chat client and messaging service) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Our username, registered with the directory
    pub username: String,

    /// Listen address of the messaging service
    pub listen_addr: IpAddr,

    /// Port of our messaging service, and of every other peer's
    pub peer_port: u16,

    /// Address of the directory server
    pub lookup_addr: IpAddr,

    /// Port of the directory server
    pub lookup_port: u16,

    /// Data directory holding the identity and history files
    pub data_dir: PathBuf,

    /// Accept loop poll interval in milliseconds
    pub accept_poll_ms: u64,

    /// Per-connection timeout in seconds
    pub io_timeout_secs: u64,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            username: "anonymous".to_string(),
            listen_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            peer_port: protocol::PEER_PORT,
            lookup_addr: IpAddr::V6(Ipv6Addr::LOCALHOST),
            lookup_port: protocol::LOOKUP_PORT,
            data_dir: default_data_dir(".peerchat"),
            accept_poll_ms: protocol::ACCEPT_POLL_INTERVAL_MS,
            io_timeout_secs: protocol::IO_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_peer_port(mut self, port: u16) -> Self {
        self.peer_port = port;
        self
    }

    pub fn with_lookup_server(mut self, addr: IpAddr, port: u16) -> Self {
        self.lookup_addr = addr;
        self.lookup_port = port;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.peer_port)
    }

    pub fn lookup_socket(&self) -> SocketAddr {
        SocketAddr::new(self.lookup_addr, self.lookup_port)
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(files::HISTORY_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join(files::CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(files::KEY_FILE)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Check the username and the accept loop settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::Username::new(self.username.as_str())
            .map_err(|e| ConfigError::Invalid(format!("username: {}", e)))?;
        if self.accept_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "accept poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(self, path)
    }
}

fn default_data_dir(name: &str) -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

    toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let contents =
        toml::to_string_pretty(value).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

    Ok(())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
