//! Node context -- every component of one node, passed explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_cluster::NodeServerProvider;
use fleet_network::{
    ChannelHandler, ChannelMessageListeners, ChunkSessionRegistry, RpcProviderRegistry,
};
use fleet_protocol::{NodeId, NodeInfoSnapshot, ProtocolLimits};
use fleet_storage::TemplateStorageProvider;
use fleet_sync::DataSyncRegistry;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::NodeChannelHandler;
use crate::config::NodeConfig;
use crate::data::ClusterData;
use crate::internal::InternalMessageListener;
use crate::messenger::ClusterMessenger;
use crate::services::{CloudServiceFactory, LocalServiceRegistry, ServiceRegistry};
use crate::template_deploy::{TemplateDeployCallback, DEPLOY_TEMPLATE_TRANSFER};
use crate::tick::TickGate;

/// Who is on the other end of an authenticated channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOwner {
    Node(NodeId),
    Service(Uuid),
}

pub struct NodeContext {
    local_id: NodeId,
    cluster_id: Uuid,
    limits: ProtocolLimits,
    startup_millis: i64,
    draining: AtomicBool,
    shutdown: broadcast::Sender<()>,
    owners: RwLock<HashMap<u64, ChannelOwner>>,

    pub provider: NodeServerProvider,
    pub data_sync: DataSyncRegistry,
    pub data: ClusterData,
    pub local_services: LocalServiceRegistry,
    pub services: ServiceRegistry,
    pub rpc: RpcProviderRegistry,
    pub chunks: ChunkSessionRegistry,
    pub channel_messages: ChannelMessageListeners,
    pub templates: Arc<TemplateStorageProvider>,
    pub tick_gate: TickGate,
}

impl NodeContext {
    /// Wire up a node. Internal listeners, the service factory and the
    /// template deploy callback are registered before anything connects.
    pub fn new(config: &NodeConfig, templates: TemplateStorageProvider) -> Arc<Self> {
        let limits = config.limits();
        let local_id = config.node.unique_id.clone();
        let (shutdown, _) = broadcast::channel(1);

        Arc::new_cyclic(|weak| {
            let data_sync = DataSyncRegistry::new();
            let data = ClusterData::new();
            data.register(&data_sync);

            let rpc = RpcProviderRegistry::new();
            rpc.register(CloudServiceFactory::target(weak.clone()));

            let channel_messages = ChannelMessageListeners::new();
            channel_messages.add(Arc::new(InternalMessageListener::new(weak.clone())));

            let templates = Arc::new(templates);
            let tick_gate = TickGate::new();
            let chunks = ChunkSessionRegistry::new(std::time::Duration::from_secs(
                limits.chunk_session_timeout_secs,
            ));
            chunks.register_callback(
                DEPLOY_TEMPLATE_TRANSFER,
                Arc::new(TemplateDeployCallback::new(templates.clone(), tick_gate.clone())),
            );

            Self {
                provider: NodeServerProvider::new(config.local_node(), config.peers()),
                local_services: LocalServiceRegistry::new(local_id.clone()),
                services: ServiceRegistry::new(),
                local_id,
                cluster_id: config.node.cluster_id,
                limits,
                startup_millis: chrono::Utc::now().timestamp_millis(),
                draining: AtomicBool::new(false),
                shutdown,
                owners: RwLock::new(HashMap::new()),
                data_sync,
                data,
                rpc,
                chunks,
                channel_messages,
                templates,
                tick_gate,
            }
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    pub fn limits(&self) -> &ProtocolLimits {
        &self.limits
    }

    pub fn messenger(&self) -> ClusterMessenger<'_> {
        ClusterMessenger::new(self)
    }

    /// Channel handler for connections this node accepts (`inbound`) or dials.
    pub fn channel_handler(self: &Arc<Self>, inbound: bool) -> Arc<dyn ChannelHandler> {
        Arc::new(NodeChannelHandler::new(Arc::downgrade(self), inbound))
    }

    // -- Draining & shutdown --

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn set_draining(&self, draining: bool) {
        if self.draining.swap(draining, Ordering::AcqRel) != draining {
            tracing::info!(node = %self.local_id, draining, "draining state changed");
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        tracing::info!(node = %self.local_id, "shutdown requested");
        let _ = self.shutdown.send(());
    }

    // -- Channel owners --

    pub fn record_owner(&self, channel_id: u64, owner: ChannelOwner) {
        self.owners.write().insert(channel_id, owner);
    }

    pub fn owner(&self, channel_id: u64) -> Option<ChannelOwner> {
        self.owners.read().get(&channel_id).cloned()
    }

    pub fn take_owner(&self, channel_id: u64) -> Option<ChannelOwner> {
        self.owners.write().remove(&channel_id)
    }

    /// This node's state as it is published to the cluster.
    pub fn node_info(&self) -> NodeInfoSnapshot {
        NodeInfoSnapshot {
            unique_id: self.local_id.clone(),
            startup_millis: self.startup_millis,
            creation_millis: chrono::Utc::now().timestamp_millis(),
            draining: self.is_draining(),
            local_services: self.local_services.len() as u32,
            running_services: self.local_services.running() as u32,
        }
    }
}
