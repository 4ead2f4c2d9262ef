//! Authorization handshake and the channel lifecycle around it.
//!
//! Every inbound channel starts with only the auth listener installed. The
//! first packet decides who is connecting:
//!
//!   - a node of the same cluster: a peer this node remembers as
//!     disconnected gets forced cluster data and must acknowledge it with its
//!     service snapshots before it counts as ready; any other known peer is
//!     ready right away.
//!   - a service hosted by this node, identified by its connection secret.
//!
//! Either way the auth listener is swapped for the steady-state listeners in
//! one step. A failed handshake gets a single failure reply and the channel
//! is closed.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fleet_cluster::{ClusterError, NodeServer, NodeServerState};
use fleet_network::{
    Channel, ChannelHandler, ListenerResult, NetworkClient, PacketListener, QueryError,
    TransportError,
};
use fleet_protocol::{
    tags, AuthRequest, AuthResponse, NetworkClusterNode, Packet, ProtocolError, ServiceId,
    ServiceSyncAck, INTERNAL_PACKET_ID,
};
use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::context::{ChannelOwner, NodeContext};
use crate::internal;
use crate::messenger;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("auth query failed: {0}")]
    Query(#[from] QueryError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("rejected by peer")]
    Rejected,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("node {0} has no usable listener")]
    InvalidListener(String),
}

type ListenerSet = Vec<(String, u32, Arc<dyn PacketListener>)>;

/// Listeners of an authenticated node channel.
fn node_listeners(ctx: &Arc<NodeContext>) -> ListenerSet {
    let rpc: Arc<dyn PacketListener> = Arc::new(ctx.rpc.clone());
    let chunks: Arc<dyn PacketListener> = Arc::new(ctx.chunks.clone());
    vec![
        (tags::RPC.to_string(), INTERNAL_PACKET_ID, rpc),
        (tags::CHANNEL_MESSAGE.to_string(), INTERNAL_PACKET_ID, messenger::router(ctx)),
        (tags::CHUNKED_TRANSFER.to_string(), INTERNAL_PACKET_ID, chunks),
    ]
}

/// Listeners of an authenticated service channel. Same set as for nodes;
/// the router tells the two apart by the message sender.
fn service_listeners(ctx: &Arc<NodeContext>) -> ListenerSet {
    node_listeners(ctx)
}

// ============================================================================
// Channel lifecycle
// ============================================================================

/// Installs the auth listener on inbound channels and cleans up after any
/// authenticated channel closes.
pub struct NodeChannelHandler {
    ctx: Weak<NodeContext>,
    inbound: bool,
}

impl NodeChannelHandler {
    pub fn new(ctx: Weak<NodeContext>, inbound: bool) -> Self {
        Self { ctx, inbound }
    }
}

impl ChannelHandler for NodeChannelHandler {
    fn on_open(&self, channel: &Channel) {
        if self.inbound {
            channel.listeners().register(
                tags::AUTH,
                INTERNAL_PACKET_ID,
                Arc::new(AuthListener {
                    ctx: self.ctx.clone(),
                }),
            );
        }
    }

    fn on_close(&self, channel: &Channel) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        match ctx.take_owner(channel.id()) {
            Some(ChannelOwner::Node(node)) => match ctx.provider.channel_closed(&node, channel.id()) {
                Ok(true) => {
                    let removed = ctx.services.remove_node(&node);
                    tracing::info!(peer = %node, services_removed = removed, "peer disconnected");
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(peer = %node, "failed to record disconnect: {e}"),
            },
            Some(ChannelOwner::Service(id)) => {
                if let Some(snapshot) = ctx.local_services.detach_channel(&id, channel.id()) {
                    tracing::info!(service = %snapshot.service_id.name(), "service disconnected");
                    internal::publish_service_info(&ctx, &snapshot);
                }
            }
            None => {}
        }
    }
}

// ============================================================================
// Responder
// ============================================================================

struct AuthListener {
    ctx: Weak<NodeContext>,
}

/// Send one failure reply, then close. The reason stays in the log.
fn reject(channel: &Channel, request: &Packet, reason: &str) -> ListenerResult {
    tracing::warn!(remote = %channel.remote_addr(), reason, "authorization rejected");
    let sent = send_rejection(channel, request);
    channel.close();
    sent
}

fn send_rejection(channel: &Channel, request: &Packet) -> ListenerResult {
    channel.send(Packet::json_response_to(request, &AuthResponse::rejected())?)?;
    Ok(())
}

impl PacketListener for AuthListener {
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult {
        let Some(ctx) = self.ctx.upgrade() else {
            channel.close();
            return Ok(());
        };
        let request: AuthRequest = match packet.decode_json() {
            Ok(request) => request,
            Err(e) => return reject(channel, packet, &format!("malformed auth request: {e}")),
        };
        match request {
            AuthRequest::Node { cluster_id, node } => {
                authorize_node(&ctx, channel, packet, cluster_id, node)
            }
            AuthRequest::Service {
                connection_secret,
                service_id,
            } => authorize_service(&ctx, channel, packet, &service_id, &connection_secret),
        }
    }
}

fn authorize_node(
    ctx: &Arc<NodeContext>,
    channel: &Channel,
    request: &Packet,
    cluster_id: Uuid,
    node: NetworkClusterNode,
) -> ListenerResult {
    if cluster_id != ctx.cluster_id() {
        return reject(channel, request, "cluster id mismatch");
    }
    let server = match ctx.provider.node(&node.unique_id) {
        Some(server) if !server.is_local() => server,
        _ => return reject(channel, request, &format!("unknown node {}", node.unique_id)),
    };
    let previous = server.state();
    let reconnect = match previous {
        NodeServerState::Disconnected => true,
        // Both sides dialed at once; the dial of the smaller id wins.
        NodeServerState::Connecting if ctx.local_id() < &node.unique_id => {
            return reject(channel, request, "simultaneous connect");
        }
        // Syncing and Ready: the peer redialed before its old channel was
        // noticed as gone. The new channel replaces the old one.
        NodeServerState::Unavailable
        | NodeServerState::Connecting
        | NodeServerState::Syncing
        | NodeServerState::Ready => false,
    };
    if previous == NodeServerState::Ready {
        let removed = ctx.services.remove_node(&node.unique_id);
        tracing::info!(peer = %node.unique_id, services_removed = removed, "peer redialed, replacing its channel");
    }

    let response = if reconnect {
        let payload = ctx.data_sync.prepare_cluster_data(&node.unique_id, true);
        if let Err(e) = ctx.provider.transition(&node.unique_id, NodeServerState::Syncing) {
            return reject(channel, request, &e.to_string());
        }
        attach(ctx, &server, channel);
        let ack: Arc<dyn PacketListener> = Arc::new(ServiceSyncAckListener {
            ctx: Arc::downgrade(ctx),
            node: node.unique_id.clone(),
        });
        let mut listeners = node_listeners(ctx);
        listeners.push((tags::SERVICE_SYNC_ACK.to_string(), INTERNAL_PACKET_ID, ack));
        channel.listeners().replace(tags::AUTH, listeners);
        AuthResponse::accepted(true, Some(payload))
    } else {
        attach(ctx, &server, channel);
        if let Err(e) = ctx.provider.transition(&node.unique_id, NodeServerState::Ready) {
            return reject(channel, request, &e.to_string());
        }
        channel.listeners().replace(tags::AUTH, node_listeners(ctx));
        AuthResponse::accepted(false, None)
    };

    channel.send(Packet::json_response_to(request, &response)?)?;
    tracing::info!(peer = %node.unique_id, reconnect, remote = %channel.remote_addr(), "node authorized");
    if !reconnect {
        internal::announce_services(ctx, &node.unique_id);
    }
    Ok(())
}

fn authorize_service(
    ctx: &Arc<NodeContext>,
    channel: &Channel,
    request: &Packet,
    service_id: &ServiceId,
    secret: &str,
) -> ListenerResult {
    if let Err(e) = ctx.local_services.authenticate(service_id, secret) {
        return reject(channel, request, &e.to_string());
    }
    let id = service_id.unique_id;
    ctx.record_owner(channel.id(), ChannelOwner::Service(id));
    let snapshot = match ctx.local_services.attach_channel(&id, channel.clone()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            ctx.take_owner(channel.id());
            return reject(channel, request, &e.to_string());
        }
    };
    channel.listeners().replace(tags::AUTH, service_listeners(ctx));
    channel.send(Packet::json_response_to(request, &AuthResponse::accepted(false, None))?)?;

    tracing::info!(service = %snapshot.service_id.name(), remote = %channel.remote_addr(), "service authorized");
    internal::publish_service_info(ctx, &snapshot);
    Ok(())
}

/// Bind `channel` to the peer, closing a stale one it replaces.
fn attach(ctx: &NodeContext, server: &NodeServer, channel: &Channel) {
    ctx.record_owner(channel.id(), ChannelOwner::Node(server.unique_id().clone()));
    if let Some(previous) = server.attach_channel(channel.clone()) {
        if previous.id() != channel.id() {
            previous.close();
        }
    }
}

/// Completes a reconnect on the responder once the peer applied the data.
struct ServiceSyncAckListener {
    ctx: Weak<NodeContext>,
    node: String,
}

impl PacketListener for ServiceSyncAckListener {
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult {
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(());
        };
        let ack: ServiceSyncAck = packet.decode_json()?;
        let services = ack.services.len();
        for snapshot in ack.services {
            ctx.services.update(snapshot);
        }
        channel.listeners().remove(tags::SERVICE_SYNC_ACK);
        ctx.provider.transition(&self.node, NodeServerState::Ready)?;
        tracing::info!(peer = %self.node, services, "peer resynced");
        internal::announce_services(&ctx, &self.node);
        Ok(())
    }
}

// ============================================================================
// Initiator
// ============================================================================

/// Dials configured peers and runs the initiator side of the handshake.
#[derive(Clone)]
pub struct NodeConnector {
    ctx: Arc<NodeContext>,
    client: Arc<NetworkClient>,
}

impl NodeConnector {
    pub fn new(ctx: Arc<NodeContext>, client: NetworkClient) -> Self {
        Self {
            ctx,
            client: Arc::new(client),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Dial every peer that is not connected and has a listener to dial.
    pub async fn connect_all(&self) {
        let mut dials = JoinSet::new();
        for server in self.ctx.provider.peers() {
            let idle = matches!(
                server.state(),
                NodeServerState::Unavailable | NodeServerState::Disconnected
            );
            if !idle || server.node().listeners.is_empty() {
                continue;
            }
            let connector = self.clone();
            let server = server.clone();
            dials.spawn(async move {
                if let Err(e) = connector.connect(&server).await {
                    tracing::debug!(peer = %server.unique_id(), "dial failed: {e}");
                }
            });
        }
        while dials.join_next().await.is_some() {}
    }

    /// Connect to `server` and authenticate. On failure the peer returns to
    /// the state it had before, unless a concurrent inbound handshake moved it.
    pub async fn connect(&self, server: &Arc<NodeServer>) -> Result<(), AuthError> {
        let id = server.unique_id().clone();
        let addr = pick_listener(server.node())?;
        let previous = self.ctx.provider.transition(&id, NodeServerState::Connecting)?;

        let result = match self.client.connect(addr, self.ctx.channel_handler(false)).await {
            Ok(channel) => authenticate(&self.ctx, server, channel).await,
            Err(e) => Err(e.into()),
        };
        if result.is_err() && server.state() == NodeServerState::Connecting {
            if let Err(e) = self.ctx.provider.transition(&id, previous) {
                tracing::warn!(peer = %id, "failed to restore state after dial: {e}");
            }
        }
        result
    }
}

fn pick_listener(node: &NetworkClusterNode) -> Result<SocketAddr, AuthError> {
    let addrs: Vec<SocketAddr> = node
        .listeners
        .iter()
        .filter_map(|l| l.parse().ok())
        .collect();
    addrs
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or_else(|| AuthError::InvalidListener(node.unique_id.clone()))
}

/// Initiator side of the node handshake over an open `channel`.
pub async fn authenticate(
    ctx: &Arc<NodeContext>,
    server: &Arc<NodeServer>,
    channel: Channel,
) -> Result<(), AuthError> {
    let id = server.unique_id().clone();
    // Installed before the request so nothing the peer sends right after
    // accepting can arrive without a listener.
    ctx.record_owner(channel.id(), ChannelOwner::Node(id.clone()));
    channel.listeners().replace(tags::AUTH, node_listeners(ctx));

    let result = exchange(ctx, server, &channel).await;
    if result.is_err() {
        channel.close();
    }
    result
}

async fn exchange(ctx: &Arc<NodeContext>, server: &Arc<NodeServer>, channel: &Channel) -> Result<(), AuthError> {
    let id = server.unique_id();
    let request = Packet::json(
        tags::AUTH,
        INTERNAL_PACKET_ID,
        &AuthRequest::Node {
            cluster_id: ctx.cluster_id(),
            node: ctx.provider.local_node().node().clone(),
        },
    )?;
    let timeout = Duration::from_secs(ctx.limits().auth_timeout_secs);
    let response: AuthResponse = channel.send_query(request, timeout).await?.decode_json()?;
    if !response.success {
        return Err(AuthError::Rejected);
    }

    if let Some(previous) = server.attach_channel(channel.clone()) {
        if previous.id() != channel.id() {
            previous.close();
        }
    }
    if response.reconnect {
        if let Some(payload) = &response.sync_payload {
            let report = ctx.data_sync.apply_cluster_data(payload);
            tracing::info!(peer = %id, applied = report.applied, failed = report.failed, "applied cluster data from peer");
        }
        let ack = ServiceSyncAck {
            services: ctx.local_services.snapshots(),
        };
        channel.send(Packet::json(tags::SERVICE_SYNC_ACK, INTERNAL_PACKET_ID, &ack)?)
            .map_err(|e| AuthError::Query(e.into()))?;
    }
    ctx.provider.transition(id, NodeServerState::Ready)?;
    tracing::info!(peer = %id, reconnect = response.reconnect, remote = %channel.remote_addr(), "connected to peer");
    if !response.reconnect {
        internal::announce_services(ctx, id);
    }
    Ok(())
}
