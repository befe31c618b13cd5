/// peerchat daemon support
///
/// Shared startup code for the `peerchat` and `peerchat-lookup` binaries:
/// configuration files and logging.

use peerchat_common::{ConfigError, DirectoryConfig, PeerConfig};
use std::path::Path;
use tracing::{info, warn, Level};

/// A configuration that lives in a TOML file
pub trait ConfigFile: Default + Sized {
    fn from_file(path: &Path) -> Result<Self, ConfigError>;
    fn to_file(&self, path: &Path) -> Result<(), ConfigError>;
}

impl ConfigFile for DirectoryConfig {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        DirectoryConfig::from_file(path)
    }

    fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        DirectoryConfig::to_file(self, path)
    }
}

impl ConfigFile for PeerConfig {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        PeerConfig::from_file(path)
    }

    fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        PeerConfig::to_file(self, path)
    }
}

/// Load the configuration at `path`, writing the defaults there if the file
/// does not exist yet. Returns whether the defaults were used.
pub fn load_or_create<C: ConfigFile>(path: &Path) -> Result<(C, bool), ConfigError> {
    if path.exists() {
        return Ok((C::from_file(path)?, false));
    }

    let config = C::default();
    if let Err(e) = config.to_file(path) {
        // Logging may not be up yet
        eprintln!("Failed to save default config to {}: {}", path.display(), e);
    }
    Ok((config, true))
}

/// Install the global subscriber
pub fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Log where the configuration came from
pub fn log_config_source(path: &Path, defaulted: bool) {
    if defaulted {
        warn!("No configuration file found, using defaults (saved to {:?})", path);
    } else {
        info!("Loaded configuration from {:?}", path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerchat.toml");

        let (config, defaulted): (PeerConfig, bool) = load_or_create(&path).unwrap();
        assert!(defaulted);
        assert!(path.exists());

        let (reloaded, defaulted): (PeerConfig, bool) = load_or_create(&path).unwrap();
        assert!(!defaulted);
        assert_eq!(reloaded.peer_port, config.peer_port);
        assert_eq!(reloaded.username, config.username);
    }
}
