// Configuration file handling for the multipro CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/multipro/config.json
// - Linux: ~/.config/multipro/config.json
// - Windows: %APPDATA%\multipro\config.json

use anyhow::{Context, Result};
use multipro_core::NodeConfig;
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("multipro"))
}

/// Get the default config file path
pub fn default_config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Resolve the config path, falling back to the platform default
pub fn resolve_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => default_config_file(),
    }
}

/// Load config from file, or use defaults if it does not exist yet
pub fn load_or_default(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        NodeConfig::load(path)
    } else {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        Ok(NodeConfig::default())
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub seed: Option<u8>,
    pub listen: Vec<String>,
    pub peers: Vec<String>,
    pub bootstrap: Vec<String>,
    pub relay: Option<String>,
    pub interval: Option<u64>,
}

impl Overrides {
    pub fn apply(self, config: &mut NodeConfig) {
        if let Some(seed) = self.seed {
            config.identity.seed = Some(seed);
            config.identity.secret_key_hex = None;
        }
        if !self.listen.is_empty() {
            config.listen_addrs = self.listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap = self.bootstrap;
        }
        if self.relay.is_some() {
            config.relay = self.relay;
        }
        if let Some(interval) = self.interval {
            config.round_interval_secs = interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_existing_file_is_loaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = NodeConfig::default();
        config.round_interval_secs = 3;
        config.save(&path).unwrap();

        assert_eq!(load_or_default(&path).unwrap().round_interval_secs, 3);
    }

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let mut config = NodeConfig::default();
        config.identity.secret_key_hex = Some("01".repeat(32));
        config.peers = vec!["kept".into()];

        Overrides {
            seed: Some(4),
            relay: Some("/ip4/1.2.3.4/tcp/8000".into()),
            interval: Some(1),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.identity.seed, Some(4));
        assert!(config.identity.secret_key_hex.is_none());
        assert_eq!(config.peers, vec!["kept".to_string()]);
        assert_eq!(config.relay.as_deref(), Some("/ip4/1.2.3.4/tcp/8000"));
        assert_eq!(config.round_interval_secs, 1);
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = PathBuf::from("/tmp/elsewhere.json");
        assert_eq!(resolve_path(Some(path.clone())).unwrap(), path);
    }
}
