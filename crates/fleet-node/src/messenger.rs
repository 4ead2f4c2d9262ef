//! Cluster routing for channel messages.
//!
//! A message sent on this node reaches the local subscribers, every peer that
//! may host a target and every matching local service. A message received
//! from a peer is only delivered locally; the sending node already reached
//! the rest of the cluster.

use std::sync::{Arc, Weak};
use std::time::Duration;

use fleet_network::messaging::{message_packet, query_message, reply_packet};
use fleet_network::{Channel, ListenerResult, PacketListener};
use fleet_protocol::{
    ChannelMessage, ChannelMessageTarget, Packet, SenderKind, ServiceInfoSnapshot,
};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::context::NodeContext;

/// Whether `target` addresses the node `node`.
pub fn targets_node(target: &ChannelMessageTarget, node: &str) -> bool {
    match target {
        ChannelMessageTarget::AllNodes => true,
        ChannelMessageTarget::Node(id) => id == node,
        _ => false,
    }
}

/// Whether `target` addresses the service described by `snapshot`.
pub fn targets_service(target: &ChannelMessageTarget, snapshot: &ServiceInfoSnapshot) -> bool {
    match target {
        ChannelMessageTarget::AllServices => true,
        ChannelMessageTarget::Service(name) => *name == snapshot.service_id.name(),
        ChannelMessageTarget::Task(task) => *task == snapshot.service_id.task_name,
        ChannelMessageTarget::Group(group) => snapshot.groups.iter().any(|g| g == group),
        ChannelMessageTarget::AllNodes | ChannelMessageTarget::Node(_) => false,
    }
}

/// Routes messages on behalf of one node.
pub struct ClusterMessenger<'a> {
    ctx: &'a NodeContext,
}

impl<'a> ClusterMessenger<'a> {
    pub fn new(ctx: &'a NodeContext) -> Self {
        Self { ctx }
    }

    fn for_local_node(&self, message: &ChannelMessage) -> bool {
        message
            .targets
            .iter()
            .any(|t| targets_node(t, self.ctx.local_id()))
    }

    /// Whether the peer `node` hosts a target of `message`, as far as the
    /// cluster view knows. Services nobody has reported yet count as remote.
    fn for_peer(&self, message: &ChannelMessage, node: &str) -> bool {
        message.targets.iter().any(|target| match target {
            ChannelMessageTarget::AllNodes | ChannelMessageTarget::Node(_) => targets_node(target, node),
            ChannelMessageTarget::Service(name) => self
                .ctx
                .services
                .by_name(name)
                .map_or(true, |s| s.service_id.node_unique_id == node),
            ChannelMessageTarget::AllServices
            | ChannelMessageTarget::Task(_)
            | ChannelMessageTarget::Group(_) => true,
        })
    }

    /// Connected local services addressed by `message`, minus its sender.
    fn local_service_channels(&self, message: &ChannelMessage) -> Vec<(ServiceInfoSnapshot, Channel)> {
        self.ctx
            .local_services
            .connected()
            .into_iter()
            .filter(|(snapshot, _)| {
                let is_sender = message.sender.kind == SenderKind::Service
                    && message.sender.name == snapshot.service_id.name();
                !is_sender && message.targets.iter().any(|t| targets_service(t, snapshot))
            })
            .collect()
    }

    fn deliver_to_services(&self, message: &ChannelMessage) -> usize {
        let channels = self.local_service_channels(message);
        if channels.is_empty() {
            return 0;
        }
        let packet = match message_packet(message) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(channel = %message.channel, "failed to encode channel message: {e}");
                return 0;
            }
        };
        channels
            .iter()
            .filter(|(_, channel)| channel.send(packet.clone()).is_ok())
            .count()
    }

    /// Deliver `message` to every target in the cluster. Returns how many
    /// destinations (this node, peers, local services) it was handed to.
    pub fn send(&self, message: &ChannelMessage) -> usize {
        let mut delivered = 0;
        if self.for_local_node(message) {
            self.ctx.channel_messages.deliver(message);
            delivered += 1;
        }

        let peers: Vec<_> = self
            .ctx
            .provider
            .available_peers()
            .into_iter()
            .filter(|peer| self.for_peer(message, peer.unique_id()))
            .collect();
        if !peers.is_empty() {
            match message_packet(message) {
                Ok(packet) => {
                    for peer in peers {
                        let sent = peer.channel().is_some_and(|c| c.send(packet.clone()).is_ok());
                        if sent {
                            delivered += 1;
                        } else {
                            tracing::debug!(peer = %peer.unique_id(), "peer channel gone, message dropped");
                        }
                    }
                }
                Err(e) => tracing::warn!(channel = %message.channel, "failed to encode channel message: {e}"),
            }
        }

        delivered + self.deliver_to_services(message)
    }

    /// Deliver a message that arrived from a peer to this node and its services.
    pub fn deliver_received(&self, message: &ChannelMessage) -> usize {
        let mut delivered = 0;
        if self.for_local_node(message) {
            self.ctx.channel_messages.deliver(message);
            delivered += 1;
        }
        delivered + self.deliver_to_services(message)
    }

    /// Local subscribers answer synchronously, before anything is sent.
    fn answer_here(&self, message: &ChannelMessage) -> Option<Vec<u8>> {
        if self.for_local_node(message) {
            return self.ctx.channel_messages.deliver(message);
        }
        None
    }

    fn service_targets(&self, message: &ChannelMessage) -> Vec<(String, Channel)> {
        self.local_service_channels(message)
            .into_iter()
            .map(|(snapshot, channel)| (snapshot.service_id.name(), channel))
            .collect()
    }

    /// Answer from this node or one of its services, within `timeout`.
    pub async fn query_local(&self, message: &ChannelMessage, timeout: Duration) -> Option<Vec<u8>> {
        if let Some(reply) = self.answer_here(message) {
            return Some(reply);
        }
        first_reply(self.service_targets(message), message, Instant::now() + timeout).await
    }

    /// Send `message` as a query and return the first reply from any
    /// destination. Local subscribers are asked first; services and peers
    /// are then queried together, and the whole call ends after `timeout`.
    pub async fn send_and_await_single(&self, message: &ChannelMessage, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        if let Some(reply) = self.answer_here(message) {
            return Some(reply);
        }

        let mut targets = self.service_targets(message);
        targets.extend(
            self.ctx
                .provider
                .available_peers()
                .into_iter()
                .filter(|peer| self.for_peer(message, peer.unique_id()))
                .filter_map(|peer| peer.channel().map(|c| (peer.unique_id().clone(), c))),
        );
        first_reply(targets, message, deadline).await
    }
}

/// Query every target at once and return the first reply carrying content.
/// Queries still running at `deadline` are abandoned.
async fn first_reply(
    targets: Vec<(String, Channel)>,
    message: &ChannelMessage,
    deadline: Instant,
) -> Option<Vec<u8>> {
    if targets.is_empty() {
        return None;
    }
    let mut queries = JoinSet::new();
    for (target, channel) in targets {
        let message = message.clone();
        let timeout = deadline.saturating_duration_since(Instant::now());
        queries.spawn(async move {
            match query_message(&channel, &message, timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!(%target, "channel message query failed: {e}");
                    None
                }
            }
        });
    }

    let first = async {
        while let Some(joined) = queries.join_next().await {
            if let Ok(Some(reply)) = joined {
                return Some(reply);
            }
        }
        None
    };
    // Dropping the set aborts the queries that lost the race.
    tokio::time::timeout_at(deadline, first).await.ok().flatten()
}

/// Steady-state listener for channel messages on node and service channels.
pub struct MessageRouter {
    ctx: Weak<NodeContext>,
}

impl MessageRouter {
    pub fn new(ctx: Weak<NodeContext>) -> Self {
        Self { ctx }
    }
}

impl PacketListener for MessageRouter {
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult {
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(());
        };
        let message: ChannelMessage = packet.decode_json()?;
        let from_node = message.sender.kind == SenderKind::Node;

        if !packet.is_query() {
            if from_node {
                ctx.messenger().deliver_received(&message);
            } else {
                ctx.messenger().send(&message);
            }
            return Ok(());
        }

        // Queries may wait on other channels; never block this reader.
        let channel = channel.clone();
        let request = packet.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(ctx.limits().query_timeout_secs);
            let messenger = ctx.messenger();
            let reply = if from_node {
                messenger.query_local(&message, timeout).await
            } else {
                messenger.send_and_await_single(&message, timeout).await
            };
            match reply_packet(&request, reply) {
                Ok(response) => {
                    if channel.send(response).is_err() {
                        tracing::debug!(channel = channel.id(), "query answered after channel closed");
                    }
                }
                Err(e) => tracing::warn!("failed to encode channel message reply: {e}"),
            }
        });
        Ok(())
    }
}

/// Shared handle to the router, for listener registration.
pub fn router(ctx: &Arc<NodeContext>) -> Arc<dyn PacketListener> {
    Arc::new(MessageRouter::new(Arc::downgrade(ctx)))
}
