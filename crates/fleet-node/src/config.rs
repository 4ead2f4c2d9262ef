//! Configuration types for fleet-node.
//! Parsed from ~/.fleet/config.toml.

use fleet_protocol::{NetworkClusterNode, ProtocolLimits, DEFAULT_LIMITS};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub templates: TemplatesSection,
    #[serde(default)]
    pub tick: TickSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_unique_id")]
    pub unique_id: String,
    /// Every node of one cluster shares this id.
    #[serde(default = "Uuid::nil")]
    pub cluster_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listeners")]
    pub listeners: Vec<String>,
    /// QUIC with a self-signed certificate instead of plain TCP.
    #[serde(default)]
    pub encryption: bool,
    #[serde(default = "default_transport_key")]
    pub transport_key: String,
    /// Runtime worker threads; sized from the host when absent.
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            encryption: false,
            transport_key: default_transport_key(),
            worker_threads: None,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterSection {
    #[serde(default)]
    pub nodes: Vec<ClusterNodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeEntry {
    pub unique_id: String,
    /// Empty for a peer this node never dials; it may still connect to us.
    #[serde(default)]
    pub listeners: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesSection {
    #[serde(default = "default_template_dir")]
    pub directory: String,
}

impl Default for TemplatesSection {
    fn default() -> Self {
        Self {
            directory: default_template_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSection {
    #[serde(default = "default_tick_interval")]
    pub interval_ms: u64,
    /// Seconds between dial rounds to peers that are not connected.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

impl Default for TickSection {
    fn default() -> Self {
        Self {
            interval_ms: default_tick_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

// Default value functions
fn default_unique_id() -> String {
    "node-1".into()
}
fn default_listeners() -> Vec<String> {
    vec!["0.0.0.0:1410".into()]
}
fn default_transport_key() -> String {
    "~/.fleet/transport.key".into()
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_LIMITS.max_frame_bytes
}
fn default_template_dir() -> String {
    "~/.fleet/templates".into()
}
fn default_tick_interval() -> u64 {
    DEFAULT_LIMITS.tick_interval_ms
}
fn default_reconnect_interval() -> u64 {
    DEFAULT_LIMITS.reconnect_interval_secs
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// This node as it introduces itself to peers.
    pub fn local_node(&self) -> NetworkClusterNode {
        NetworkClusterNode {
            unique_id: self.node.unique_id.clone(),
            listeners: self.network.listeners.clone(),
        }
    }

    /// Configured peers, without an entry for this node.
    pub fn peers(&self) -> Vec<NetworkClusterNode> {
        self.cluster
            .nodes
            .iter()
            .filter(|n| n.unique_id != self.node.unique_id)
            .map(|n| NetworkClusterNode {
                unique_id: n.unique_id.clone(),
                listeners: n.listeners.clone(),
            })
            .collect()
    }

    /// Cluster limits with the node-local overrides applied.
    pub fn limits(&self) -> ProtocolLimits {
        ProtocolLimits {
            max_frame_bytes: self.network.max_frame_bytes,
            tick_interval_ms: self.tick.interval_ms.max(1),
            reconnect_interval_secs: self.tick.reconnect_interval_secs.max(1),
            ..DEFAULT_LIMITS
        }
    }

    pub fn listen_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.network
            .listeners
            .iter()
            .map(|l| {
                l.parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("invalid listener {l:?}: {e}"))
            })
            .collect()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                unique_id: default_unique_id(),
                cluster_id: Uuid::nil(),
            },
            network: NetworkSection::default(),
            cluster: ClusterSection::default(),
            templates: TemplatesSection::default(),
            tick: TickSection::default(),
        }
    }
}
