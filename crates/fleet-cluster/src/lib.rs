//! Fleet Cluster -- node membership state machine and head election.
//!
//! Every configured peer has one `NodeServer` for the lifetime of the process.
//! Connecting and disconnecting move it through the lifecycle below; the head
//! is re-elected whenever a node enters or leaves `Ready`.
//!
//! ```text
//! Unavailable ─► Connecting ─► Syncing ─► Ready ─► Disconnected
//! Unavailable ─► Ready                 (fresh responder)
//! Disconnected ─► Syncing ─► Ready     (reconnect responder)
//! Connecting ─► Unavailable | Disconnected   (failed dial)
//! ```

use serde::{Deserialize, Serialize};

pub mod provider;
pub mod server;

pub use provider::{ClusterEvent, NodeServerProvider};
pub use server::NodeServer;

/// RPC interface id of the service factory every node exposes.
pub const SERVICE_FACTORY_INTERFACE: &str = "CloudServiceFactory";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("node {node}: illegal transition {from} -> {to}")]
    IllegalTransition {
        node: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeServerState {
    /// Never connected since startup.
    Unavailable,
    /// Handshake in flight.
    Connecting,
    /// Reconnected; waiting for the peer to apply cluster data.
    Syncing,
    Ready,
    /// Was connected, lost the channel.
    Disconnected,
}

impl NodeServerState {
    pub fn name(&self) -> &'static str {
        match self {
            NodeServerState::Unavailable => "unavailable",
            NodeServerState::Connecting => "connecting",
            NodeServerState::Syncing => "syncing",
            NodeServerState::Ready => "ready",
            NodeServerState::Disconnected => "disconnected",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, NodeServerState::Ready)
    }

    /// Whether the node ever passed authentication.
    pub fn was_connected(&self) -> bool {
        matches!(
            self,
            NodeServerState::Syncing | NodeServerState::Ready | NodeServerState::Disconnected
        )
    }

    /// Legal lifecycle moves. Staying in the same state is always allowed.
    pub fn can_transition_to(&self, to: NodeServerState) -> bool {
        use NodeServerState::*;
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (Unavailable, Connecting)
                | (Unavailable, Ready)
                | (Connecting, Syncing)
                | (Connecting, Ready)
                | (Connecting, Unavailable)
                | (Connecting, Disconnected)
                | (Syncing, Ready)
                | (Syncing, Disconnected)
                | (Ready, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, Syncing)
        )
    }
}

impl std::fmt::Display for NodeServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the head: the smallest unique id among ready candidates.
///
/// Ties cannot happen since ids are unique. Returns `None` when nobody is
/// ready.
pub fn elect_head<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, NodeServerState)>,
{
    candidates
        .into_iter()
        .filter(|(_, state)| state.is_ready())
        .map(|(id, _)| id)
        .min()
}
