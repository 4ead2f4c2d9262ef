//! Service side of the node connection, used by managed service processes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_cluster::SERVICE_FACTORY_INTERFACE;
use fleet_network::messaging::{message_packet, query_message};
use fleet_network::{
    worker_threads, Channel, ChannelMessageListeners, NetworkClient, NoopHandler, QueryError,
    Role, RpcProviderRegistry, RpcSender, TransportSecurity,
};
use fleet_protocol::{
    tags, AuthRequest, AuthResponse, ChannelMessage, Packet, ServiceId, DEFAULT_LIMITS,
    INTERNAL_PACKET_ID,
};

use crate::auth::AuthError;
use crate::services::ServiceFactoryClient;

/// An authenticated channel from a service to the node hosting it.
pub struct ServiceConnection {
    channel: Channel,
    service_id: ServiceId,
    messages: ChannelMessageListeners,
    rpc: RpcProviderRegistry,
}

impl ServiceConnection {
    /// Connect to the node at `addr` and authenticate as `service_id`.
    pub async fn connect(
        addr: SocketAddr,
        security: &TransportSecurity,
        service_id: ServiceId,
        connection_secret: &str,
    ) -> Result<Self, AuthError> {
        let client = NetworkClient::new(security, DEFAULT_LIMITS.max_frame_bytes)?;
        let channel = client.connect(addr, Arc::new(NoopHandler)).await?;

        let messages = ChannelMessageListeners::new();
        let rpc = RpcProviderRegistry::new();
        channel.listeners().register(
            tags::CHANNEL_MESSAGE,
            INTERNAL_PACKET_ID,
            Arc::new(messages.clone()),
        );
        channel
            .listeners()
            .register(tags::RPC, INTERNAL_PACKET_ID, Arc::new(rpc.clone()));

        let request = Packet::json(
            tags::AUTH,
            INTERNAL_PACKET_ID,
            &AuthRequest::Service {
                connection_secret: connection_secret.to_string(),
                service_id: service_id.clone(),
            },
        )?;
        let timeout = Duration::from_secs(DEFAULT_LIMITS.auth_timeout_secs);
        let response: AuthResponse = match channel.send_query(request, timeout).await {
            Ok(packet) => packet.decode_json()?,
            Err(e) => {
                channel.close();
                return Err(e.into());
            }
        };
        if !response.success {
            channel.close();
            return Err(AuthError::Rejected);
        }

        tracing::info!(service = %service_id.name(), node = %addr, "connected to node");
        Ok(Self {
            channel,
            service_id,
            messages,
            rpc,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Subscribers for messages routed to this service.
    pub fn messages(&self) -> &ChannelMessageListeners {
        &self.messages
    }

    /// Targets this service exposes to its node.
    pub fn rpc(&self) -> &RpcProviderRegistry {
        &self.rpc
    }

    /// Hand a message to the node for routing.
    pub fn send_message(&self, message: &ChannelMessage) -> Result<(), fleet_network::ChannelError> {
        self.channel.send(message_packet(message)?)
    }

    pub async fn query_message(
        &self,
        message: &ChannelMessage,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, QueryError> {
        query_message(&self.channel, message, timeout).await
    }

    /// The hosting node's service factory.
    pub fn service_factory(&self) -> ServiceFactoryClient {
        ServiceFactoryClient::new(RpcSender::fixed(
            SERVICE_FACTORY_INTERFACE,
            self.channel.clone(),
        ))
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

/// Runtime for a managed service process.
pub fn service_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads(Role::Service))
        .enable_all()
        .build()
}
