// Node configuration
//
// Everything a node needs at construction time: identity source, addresses,
// the static peer list, optional relay and the driver/sweeper timings.
// Stored as JSON; every field has a default so partial files load.

use crate::transport::{RelayPeer, SwarmOptions};
use anyhow::{Context, Result};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CLIENT_VERSION: &str = concat!("multipro/", env!("CARGO_PKG_VERSION"));

/// Where the node's key pair comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Deterministic key derived from a single byte; for demos and tests
    pub seed: Option<u8>,

    /// Hex-encoded ed25519 secret key; wins over `seed`
    pub secret_key_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Informational version string carried in every envelope
    pub client_version: String,

    pub identity: IdentityConfig,

    /// Addresses to listen on
    pub listen_addrs: Vec<String>,

    /// Peer ids the driver probes each round
    pub peers: Vec<String>,

    /// Multiaddrs (with `/p2p/<id>`) dialed at startup
    pub bootstrap: Vec<String>,

    /// Relay multiaddr (with `/p2p/<id>`) used for peers we cannot dial
    pub relay: Option<String>,

    /// Also serve as a circuit relay for other peers
    pub relay_server: bool,

    /// Pause after each driver attempt, in seconds
    pub round_interval_secs: u64,

    /// Pending requests older than this are evicted; `None` keeps them forever
    pub request_timeout_secs: Option<u64>,

    /// How often pending requests are swept, in seconds
    pub sweep_interval_secs: u64,

    /// Idle connections are closed after this many seconds
    pub idle_connection_timeout_secs: u64,

    /// Upper bound on a single dial or reservation request, in seconds
    pub dial_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
            identity: IdentityConfig::default(),
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".to_string()],
            peers: Vec::new(),
            bootstrap: Vec::new(),
            relay: None,
            relay_server: false,
            round_interval_secs: 10,
            request_timeout_secs: Some(60),
            sweep_interval_secs: 15,
            idle_connection_timeout_secs: 300,
            dial_timeout_secs: 30,
        }
    }
}

fn parse_multiaddrs(addrs: &[String], what: &str) -> Result<Vec<Multiaddr>> {
    addrs
        .iter()
        .map(|a| {
            a.parse::<Multiaddr>()
                .with_context(|| format!("Invalid {} address: {}", what, a))
        })
        .collect()
}

impl NodeConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: NodeConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn peer_ids(&self) -> Result<Vec<PeerId>> {
        self.peers
            .iter()
            .map(|p| PeerId::from_str(p).with_context(|| format!("Invalid peer id: {}", p)))
            .collect()
    }

    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        parse_multiaddrs(&self.listen_addrs, "listen")
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<Multiaddr>> {
        parse_multiaddrs(&self.bootstrap, "bootstrap")
    }

    pub fn relay_peer(&self) -> Result<Option<RelayPeer>> {
        let Some(relay) = &self.relay else {
            return Ok(None);
        };
        let addr: Multiaddr = relay
            .parse()
            .with_context(|| format!("Invalid relay address: {}", relay))?;
        let peer = RelayPeer::from_multiaddr(addr)
            .with_context(|| format!("Relay address has no /p2p/<peer-id>: {}", relay))?;
        Ok(Some(peer))
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.round_interval_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn swarm_options(&self) -> Result<SwarmOptions> {
        Ok(SwarmOptions {
            listen_addrs: self.listen_multiaddrs()?,
            relay_server: self.relay_server,
            idle_connection_timeout: Duration::from_secs(self.idle_connection_timeout_secs),
            request_timeout: Duration::from_secs(self.dial_timeout_secs),
            ..SwarmOptions::default()
        })
    }
}
