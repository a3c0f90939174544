use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use network::{HandshakeConfig, Network, Timeouts};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub user_agent: String,
    pub db_path: PathBuf,
    /// Peers to sync from, as `ip:port`.
    pub peers: Vec<String>,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Re-request interval of a sync session that sees no progress.
    pub sync_wait_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub channel_capacity: usize,
}

impl NodeConfig {
    pub fn with_db_path(path: impl AsRef<Path>) -> Self {
        Self {
            db_path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> NodeResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Checks everything that would otherwise fail after peers are dialed.
    pub fn validate(&self) -> NodeResult<()> {
        if self.peers.is_empty() {
            return Err(NodeError::InvalidConfig("no peers configured".into()));
        }
        self.peer_addrs()?;
        for (name, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("sync_wait_ms", self.sync_wait_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
        ] {
            if value == 0 {
                return Err(NodeError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(NodeError::InvalidConfig(
                "reconnect_base_ms exceeds reconnect_max_ms".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(NodeError::InvalidConfig("channel_capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn peer_addrs(&self) -> NodeResult<Vec<SocketAddr>> {
        self.peers.iter().map(|peer| parse_peer(peer)).collect()
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn handshake(&self) -> HandshakeConfig {
        let mut handshake = HandshakeConfig::new(self.network, self.user_agent.clone());
        handshake.timeouts = self.timeouts();
        handshake.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        handshake
    }

    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

fn parse_peer(peer: &str) -> NodeResult<SocketAddr> {
    let addr: SocketAddr = peer
        .parse()
        .map_err(|_| NodeError::InvalidConfig(format!("peer '{peer}' is not an ip:port pair")))?;
    if addr.port() == 0 {
        return Err(NodeError::InvalidConfig(format!("peer '{peer}' has port 0")));
    }
    Ok(addr)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            user_agent: format!("/btc-sync-node:{}/", env!("CARGO_PKG_VERSION")),
            db_path: PathBuf::from("./data/blocks.db"),
            peers: Vec::new(),
            read_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            handshake_timeout_ms: 15_000,
            sync_wait_ms: 30_000,
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 60_000,
            channel_capacity: 1_000,
        }
    }
}
