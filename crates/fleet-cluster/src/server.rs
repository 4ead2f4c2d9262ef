//! One cluster node as seen from this process.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fleet_network::messaging::message_packet;
use fleet_network::{Channel, ChannelError, RpcSender};
use fleet_protocol::{
    internal_messages, ChannelMessage, ChannelMessageSender, ChannelMessageTarget,
    ClusterDataPayload, NetworkClusterNode, NodeId, NodeInfoSnapshot,
};
use parking_lot::RwLock;

use crate::{ClusterError, NodeServerState, SERVICE_FACTORY_INTERFACE};

struct NodeServerInner {
    state: NodeServerState,
    last_state_change: DateTime<Utc>,
    channel: Option<Channel>,
    current_info: Option<NodeInfoSnapshot>,
    last_info: Option<NodeInfoSnapshot>,
    /// Last sign of life: an info update or entering `Ready`.
    last_seen: Instant,
}

/// A configured cluster node. Lives as long as the process; losing the
/// connection changes its state, never removes it.
pub struct NodeServer {
    node: NetworkClusterNode,
    local: bool,
    inner: RwLock<NodeServerInner>,
    factory: OnceLock<RpcSender>,
}

impl std::fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("unique_id", &self.node.unique_id)
            .field("local", &self.local)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeServer {
    /// A remote peer, unavailable until it connects.
    pub fn remote(node: NetworkClusterNode) -> Self {
        Self::with_state(node, false, NodeServerState::Unavailable)
    }

    /// This process. Always ready and never holds a channel.
    pub fn local(node: NetworkClusterNode) -> Self {
        Self::with_state(node, true, NodeServerState::Ready)
    }

    fn with_state(node: NetworkClusterNode, local: bool, state: NodeServerState) -> Self {
        Self {
            node,
            local,
            inner: RwLock::new(NodeServerInner {
                state,
                last_state_change: Utc::now(),
                channel: None,
                current_info: None,
                last_info: None,
                last_seen: Instant::now(),
            }),
            factory: OnceLock::new(),
        }
    }

    pub fn unique_id(&self) -> &NodeId {
        &self.node.unique_id
    }

    pub fn node(&self) -> &NetworkClusterNode {
        &self.node
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> NodeServerState {
        self.inner.read().state
    }

    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.inner.read().last_state_change
    }

    pub fn channel(&self) -> Option<Channel> {
        self.inner.read().channel.clone()
    }

    /// Ready and reachable.
    pub fn available(&self) -> bool {
        let inner = self.inner.read();
        inner.state.is_ready()
            && (self.local || inner.channel.as_ref().is_some_and(|c| !c.is_closed()))
    }

    /// Move to `to`. Returns the previous state.
    pub(crate) fn transition(&self, to: NodeServerState) -> Result<NodeServerState, ClusterError> {
        let mut inner = self.inner.write();
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(ClusterError::IllegalTransition {
                node: self.node.unique_id.clone(),
                from: from.name(),
                to: to.name(),
            });
        }
        if from != to {
            inner.state = to;
            inner.last_state_change = Utc::now();
            if to.is_ready() {
                inner.last_seen = Instant::now();
            }
        }
        Ok(from)
    }

    /// Bind the channel the node is reachable on. Returns the replaced one.
    pub fn attach_channel(&self, channel: Channel) -> Option<Channel> {
        self.inner.write().channel.replace(channel)
    }

    /// Release the channel if it is still the one with `channel_id`.
    /// A stale channel closing after a replacement was attached is ignored.
    pub(crate) fn detach_channel(&self, channel_id: u64) -> bool {
        let mut inner = self.inner.write();
        if inner.channel.as_ref().is_some_and(|c| c.id() == channel_id) {
            inner.channel = None;
            true
        } else {
            false
        }
    }

    pub fn node_info(&self) -> Option<NodeInfoSnapshot> {
        self.inner.read().current_info.clone()
    }

    pub fn last_node_info(&self) -> Option<NodeInfoSnapshot> {
        self.inner.read().last_info.clone()
    }

    /// Record a new info snapshot, keeping the previous one. `None` clears
    /// both, as happens when the node disconnects.
    pub fn update_node_info_snapshot(&self, snapshot: Option<NodeInfoSnapshot>) {
        let mut inner = self.inner.write();
        match snapshot {
            Some(snapshot) => {
                inner.last_info = inner.current_info.replace(snapshot);
                inner.last_seen = Instant::now();
            }
            None => {
                inner.current_info = None;
                inner.last_info = None;
            }
        }
    }

    /// Ready but silent for longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        let inner = self.inner.read();
        !self.local && inner.state.is_ready() && inner.last_seen.elapsed() > timeout
    }

    /// Push a prepared cluster data payload to this node. The receiver
    /// applies it like the payload of a reconnect handshake.
    pub fn sync_cluster_data(
        &self,
        sender: &str,
        payload: &ClusterDataPayload,
    ) -> Result<(), ChannelError> {
        let channel = self.channel().ok_or(ChannelError::Closed)?;
        let message = ChannelMessage::new(
            ChannelMessageSender::node(sender),
            internal_messages::CHANNEL,
            internal_messages::SYNC_CLUSTER_DATA,
        )
        .target(ChannelMessageTarget::Node(self.node.unique_id.clone()))
        .json_content(payload)?;
        channel.send(message_packet(&message)?)?;
        tracing::debug!(
            node = %self.node.unique_id,
            force = payload.force,
            chunks = payload.chunks.len(),
            "cluster data sent"
        );
        Ok(())
    }

    /// RPC sender for the node's service factory, resolving the node's
    /// current channel on every call.
    pub fn service_factory(self: &Arc<Self>) -> RpcSender {
        self.factory
            .get_or_init(|| {
                let server: Weak<NodeServer> = Arc::downgrade(self);
                RpcSender::new(
                    SERVICE_FACTORY_INTERFACE,
                    Arc::new(move || -> Option<Channel> {
                        server.upgrade().and_then(|s| s.channel())
                    }),
                )
            })
            .clone()
    }
}
