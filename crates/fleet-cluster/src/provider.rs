//! Node server provider -- the set of cluster nodes and the elected head.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{NetworkClusterNode, NodeId};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{elect_head, ClusterError, NodeServer, NodeServerState};

const EVENT_CAPACITY: usize = 256;

/// Membership changes, published to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    StateChanged {
        node: NodeId,
        from: NodeServerState,
        to: NodeServerState,
    },
    HeadChanged {
        previous: Option<NodeId>,
        head: Option<NodeId>,
    },
}

pub struct NodeServerProvider {
    local_id: NodeId,
    servers: BTreeMap<NodeId, Arc<NodeServer>>,
    head: RwLock<Option<NodeId>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl NodeServerProvider {
    /// Build the node set from the static cluster configuration. An entry
    /// for the local node in `peers` is ignored.
    pub fn new(local: NetworkClusterNode, peers: Vec<NetworkClusterNode>) -> Self {
        let local_id = local.unique_id.clone();
        let mut servers = BTreeMap::new();
        servers.insert(local_id.clone(), Arc::new(NodeServer::local(local)));
        for peer in peers {
            if peer.unique_id == local_id {
                continue;
            }
            servers
                .entry(peer.unique_id.clone())
                .or_insert_with(|| Arc::new(NodeServer::remote(peer)));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let provider = Self {
            local_id,
            servers,
            head: RwLock::new(None),
            events,
        };
        provider.select_head_node();
        provider
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_node(&self) -> Arc<NodeServer> {
        // Inserted in new() and never removed.
        self.servers[&self.local_id].clone()
    }

    pub fn node(&self, unique_id: &str) -> Option<Arc<NodeServer>> {
        self.servers.get(unique_id).cloned()
    }

    /// Every node including the local one, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeServer>> {
        self.servers.values()
    }

    /// Remote nodes only.
    pub fn peers(&self) -> impl Iterator<Item = &Arc<NodeServer>> {
        self.servers.values().filter(|s| !s.is_local())
    }

    /// Remote nodes with a live channel in `Ready`.
    pub fn available_peers(&self) -> Vec<Arc<NodeServer>> {
        self.peers().filter(|s| s.available()).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn head_id(&self) -> Option<NodeId> {
        self.head.read().clone()
    }

    pub fn head_node(&self) -> Option<Arc<NodeServer>> {
        self.head_id().and_then(|id| self.node(&id))
    }

    pub fn is_head(&self) -> bool {
        self.head.read().as_deref() == Some(self.local_id.as_str())
    }

    /// Rerun the election and publish a change. Returns the head.
    pub fn select_head_node(&self) -> Option<NodeId> {
        let states: Vec<(NodeId, NodeServerState)> = self
            .servers
            .values()
            .map(|s| (s.unique_id().clone(), s.state()))
            .collect();
        let elected =
            elect_head(states.iter().map(|(id, state)| (id.as_str(), *state))).map(str::to_owned);

        let mut head = self.head.write();
        if *head != elected {
            let previous = std::mem::replace(&mut *head, elected.clone());
            tracing::info!(previous = ?previous, head = ?elected, "head node changed");
            let _ = self.events.send(ClusterEvent::HeadChanged {
                previous,
                head: elected.clone(),
            });
        }
        elected
    }

    /// Move `unique_id` to `to`, publishing the change and re-electing the
    /// head when the node entered or left `Ready`.
    pub fn transition(
        &self,
        unique_id: &str,
        to: NodeServerState,
    ) -> Result<NodeServerState, ClusterError> {
        let server = self
            .node(unique_id)
            .ok_or_else(|| ClusterError::UnknownNode(unique_id.to_string()))?;
        let from = server.transition(to)?;
        if from != to {
            tracing::info!(
                node = %unique_id,
                from = from.name(),
                to = to.name(),
                "node state changed"
            );
            let _ = self.events.send(ClusterEvent::StateChanged {
                node: unique_id.to_string(),
                from,
                to,
            });
            if from.is_ready() != to.is_ready() {
                self.select_head_node();
            }
        }
        Ok(from)
    }

    /// Handle the close of `channel_id`. Marks the node `Disconnected` if
    /// that channel was still its current one and the node had passed auth.
    /// Returns whether the node was disconnected.
    pub fn channel_closed(&self, unique_id: &str, channel_id: u64) -> Result<bool, ClusterError> {
        let server = self
            .node(unique_id)
            .ok_or_else(|| ClusterError::UnknownNode(unique_id.to_string()))?;
        if !server.detach_channel(channel_id) {
            return Ok(false);
        }
        server.update_node_info_snapshot(None);
        if !server.state().was_connected() {
            return Ok(false);
        }
        self.transition(unique_id, NodeServerState::Disconnected)?;
        Ok(true)
    }

    /// Ready peers that stopped reporting for longer than `timeout`.
    pub fn stale_peers(&self, timeout: Duration) -> Vec<Arc<NodeServer>> {
        self.peers().filter(|s| s.is_stale(timeout)).cloned().collect()
    }
}
