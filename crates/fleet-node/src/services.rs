//! Services -- the ones this node hosts and the cluster-wide view.
//!
//! Local services are created through the `CloudServiceFactory` RPC target.
//! Lifecycle changes requested over RPC are only recorded; the tick loop
//! applies them and publishes the new snapshots. The cluster view keeps the
//! highest revision of every service snapshot it has seen.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use fleet_cluster::SERVICE_FACTORY_INTERFACE;
use fleet_network::{Channel, MethodDescriptor, RpcDispatchTable, RpcError, RpcSender, RpcTarget};
use fleet_protocol::{
    NodeId, ServiceConfiguration, ServiceId, ServiceInfoSnapshot, ServiceLifecycle,
};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::context::NodeContext;

/// Interface id of the per-service handle returned by `provider`.
pub const SERVICE_PROVIDER_INTERFACE: &str = "SpecificCloudServiceProvider";

pub const CREATE: MethodDescriptor = MethodDescriptor::new(
    SERVICE_FACTORY_INTERFACE,
    "create",
    "(ServiceConfiguration)->ServiceInfoSnapshot",
);
pub const PROVIDER: MethodDescriptor = MethodDescriptor::new(
    SERVICE_FACTORY_INTERFACE,
    "provider",
    "(Uuid)->SpecificCloudServiceProvider",
);
pub const START: MethodDescriptor = MethodDescriptor::new(SERVICE_PROVIDER_INTERFACE, "start", "()->()");
pub const STOP: MethodDescriptor = MethodDescriptor::new(SERVICE_PROVIDER_INTERFACE, "stop", "()->()");
pub const DELETE: MethodDescriptor = MethodDescriptor::new(SERVICE_PROVIDER_INTERFACE, "delete", "()->()");
pub const INFO: MethodDescriptor = MethodDescriptor::new(
    SERVICE_PROVIDER_INTERFACE,
    "info",
    "()->Option<ServiceInfoSnapshot>",
);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("unknown service {0}")]
    UnknownService(Uuid),
    #[error("service name {0} is already taken")]
    NameTaken(String),
    #[error("service {service}: cannot move from {from} to {to}")]
    IllegalLifecycle {
        service: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("node is draining and accepts no new services")]
    Draining,
    #[error("connection secret mismatch for {0}")]
    SecretMismatch(String),
}

/// Lifecycle moves a service may make.
pub fn lifecycle_allowed(from: ServiceLifecycle, to: ServiceLifecycle) -> bool {
    use ServiceLifecycle::*;
    matches!(
        (from, to),
        (Prepared, Running)
            | (Prepared, Deleted)
            | (Running, Stopped)
            | (Stopped, Running)
            | (Stopped, Deleted)
    )
}

// ============================================================================
// Local services
// ============================================================================

struct LocalService {
    snapshot: ServiceInfoSnapshot,
    secret: String,
    channel: Option<Channel>,
    pending: Option<ServiceLifecycle>,
}

impl LocalService {
    fn bump(&mut self) -> ServiceInfoSnapshot {
        self.snapshot.revision += 1;
        self.snapshot.clone()
    }
}

/// Services hosted by this node.
pub struct LocalServiceRegistry {
    node_id: NodeId,
    services: RwLock<HashMap<Uuid, LocalService>>,
}

impl LocalServiceRegistry {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new service in `Prepared`. `taken` holds the ordinals of
    /// the task already in use anywhere in the cluster.
    pub fn create(
        &self,
        config: ServiceConfiguration,
        taken: &BTreeSet<u32>,
    ) -> Result<(ServiceInfoSnapshot, String), ServiceError> {
        let mut services = self.services.write();
        let mut used: BTreeSet<u32> = services
            .values()
            .filter(|s| s.snapshot.service_id.task_name == config.task_name)
            .map(|s| s.snapshot.service_id.task_service_id)
            .collect();
        used.extend(taken);

        let ordinal = match config.task_service_id {
            Some(ordinal) if used.contains(&ordinal) => {
                return Err(ServiceError::NameTaken(format!(
                    "{}-{}",
                    config.task_name, ordinal
                )));
            }
            Some(ordinal) => ordinal,
            None => (1..).find(|n| !used.contains(n)).unwrap_or(1),
        };

        let snapshot = ServiceInfoSnapshot {
            service_id: ServiceId {
                unique_id: Uuid::new_v4(),
                task_name: config.task_name,
                task_service_id: ordinal,
                node_unique_id: self.node_id.clone(),
            },
            lifecycle: ServiceLifecycle::Prepared,
            groups: config.groups,
            connected: false,
            created_at: chrono::Utc::now().timestamp_millis(),
            properties: config.properties,
            revision: 1,
        };
        let secret = crate::generate_secret();
        tracing::info!(
            service = %snapshot.service_id.name(),
            id = %snapshot.service_id.unique_id,
            "service created"
        );
        services.insert(
            snapshot.service_id.unique_id,
            LocalService {
                snapshot: snapshot.clone(),
                secret: secret.clone(),
                channel: None,
                pending: None,
            },
        );
        Ok((snapshot, secret))
    }

    pub fn get(&self, id: &Uuid) -> Option<ServiceInfoSnapshot> {
        self.services.read().get(id).map(|s| s.snapshot.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.services.read().contains_key(id)
    }

    pub fn connection_secret(&self, id: &Uuid) -> Option<String> {
        self.services.read().get(id).map(|s| s.secret.clone())
    }

    pub fn snapshots(&self) -> Vec<ServiceInfoSnapshot> {
        let mut snapshots: Vec<_> = self
            .services
            .read()
            .values()
            .map(|s| s.snapshot.clone())
            .collect();
        snapshots.sort_by_key(|s| s.service_id.name());
        snapshots
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    pub fn running(&self) -> usize {
        self.services
            .read()
            .values()
            .filter(|s| s.snapshot.lifecycle == ServiceLifecycle::Running)
            .count()
    }

    /// Check a connecting service's credentials. The secret must match
    /// exactly and is compared in constant time.
    pub fn authenticate(&self, service_id: &ServiceId, secret: &str) -> Result<(), ServiceError> {
        let services = self.services.read();
        let service = services
            .get(&service_id.unique_id)
            .ok_or(ServiceError::UnknownService(service_id.unique_id))?;
        if ring::constant_time::verify_slices_are_equal(service.secret.as_bytes(), secret.as_bytes()).is_err() {
            return Err(ServiceError::SecretMismatch(service.snapshot.service_id.name()));
        }
        Ok(())
    }

    /// Record the service's channel, closing one it replaces. Returns the
    /// updated snapshot.
    pub fn attach_channel(&self, id: &Uuid, channel: Channel) -> Result<ServiceInfoSnapshot, ServiceError> {
        let (snapshot, previous) = {
            let mut services = self.services.write();
            let service = services.get_mut(id).ok_or(ServiceError::UnknownService(*id))?;
            let previous = service.channel.replace(channel);
            service.snapshot.connected = true;
            (service.bump(), previous)
        };
        // Close handlers call back into the registry.
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(snapshot)
    }

    /// Forget the channel if it is still `channel_id`. Returns the updated
    /// snapshot when something changed.
    pub fn detach_channel(&self, id: &Uuid, channel_id: u64) -> Option<ServiceInfoSnapshot> {
        let mut services = self.services.write();
        let service = services.get_mut(id)?;
        if service.channel.as_ref().map(Channel::id) != Some(channel_id) {
            return None;
        }
        service.channel = None;
        service.snapshot.connected = false;
        Some(service.bump())
    }

    /// Services holding an open channel.
    pub fn connected(&self) -> Vec<(ServiceInfoSnapshot, Channel)> {
        self.services
            .read()
            .values()
            .filter_map(|s| {
                s.channel
                    .as_ref()
                    .filter(|c| !c.is_closed())
                    .map(|c| (s.snapshot.clone(), c.clone()))
            })
            .collect()
    }

    /// Queue a lifecycle change for the next tick.
    pub fn request_lifecycle(&self, id: &Uuid, to: ServiceLifecycle) -> Result<(), ServiceError> {
        let mut services = self.services.write();
        let service = services.get_mut(id).ok_or(ServiceError::UnknownService(*id))?;
        let from = service.pending.unwrap_or(service.snapshot.lifecycle);
        if from != to && !lifecycle_allowed(from, to) {
            return Err(ServiceError::IllegalLifecycle {
                service: service.snapshot.service_id.name(),
                from: from.name(),
                to: to.name(),
            });
        }
        service.pending = Some(to);
        Ok(())
    }

    /// Apply queued lifecycle changes. Deleted services are dropped and their
    /// channel closed. Returns the new snapshots.
    pub fn apply_pending(&self) -> Vec<ServiceInfoSnapshot> {
        let mut changed = Vec::new();
        let mut closing = Vec::new();
        let mut services = self.services.write();
        for service in services.values_mut() {
            let Some(to) = service.pending.take() else {
                continue;
            };
            if service.snapshot.lifecycle == to {
                continue;
            }
            tracing::info!(
                service = %service.snapshot.service_id.name(),
                from = service.snapshot.lifecycle.name(),
                to = to.name(),
                "service lifecycle changed"
            );
            service.snapshot.lifecycle = to;
            if to == ServiceLifecycle::Deleted {
                service.snapshot.connected = false;
                closing.extend(service.channel.take());
            }
            changed.push(service.bump());
        }
        services.retain(|_, s| s.snapshot.lifecycle != ServiceLifecycle::Deleted);
        drop(services);

        for channel in closing {
            channel.close();
        }
        changed
    }
}

// ============================================================================
// Cluster view
// ============================================================================

/// Every service in the cluster, keyed by unique id.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<Uuid, ServiceInfoSnapshot>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `snapshot` if it is new or supersedes the stored one. A deleted
    /// service leaves the view. Returns whether anything changed.
    pub fn update(&self, snapshot: ServiceInfoSnapshot) -> bool {
        let mut services = self.services.write();
        let id = snapshot.service_id.unique_id;
        if let Some(current) = services.get(&id) {
            if !snapshot.supersedes(current) {
                return false;
            }
        }
        if snapshot.lifecycle == ServiceLifecycle::Deleted {
            return services.remove(&id).is_some();
        }
        services.insert(id, snapshot);
        true
    }

    /// Drop every service hosted by `node`. Returns how many were removed.
    pub fn remove_node(&self, node: &str) -> usize {
        let mut services = self.services.write();
        let before = services.len();
        services.retain(|_, s| s.service_id.node_unique_id != node);
        before - services.len()
    }

    pub fn get(&self, id: &Uuid) -> Option<ServiceInfoSnapshot> {
        self.services.read().get(id).cloned()
    }

    /// Look a service up by its `<task>-<ordinal>` name.
    pub fn by_name(&self, name: &str) -> Option<ServiceInfoSnapshot> {
        self.services
            .read()
            .values()
            .find(|s| s.service_id.name() == name)
            .cloned()
    }

    pub fn find<F>(&self, predicate: F) -> Vec<ServiceInfoSnapshot>
    where
        F: Fn(&ServiceInfoSnapshot) -> bool,
    {
        let mut found: Vec<_> = self
            .services
            .read()
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.service_id.name());
        found
    }

    pub fn all(&self) -> Vec<ServiceInfoSnapshot> {
        self.find(|_| true)
    }

    /// Ordinals of `task` in use anywhere in the cluster.
    pub fn ordinals(&self, task: &str) -> BTreeSet<u32> {
        self.services
            .read()
            .values()
            .filter(|s| s.service_id.task_name == task)
            .map(|s| s.service_id.task_service_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

// ============================================================================
// Factory RPC
// ============================================================================

/// Provider side of `CloudServiceFactory`.
pub struct CloudServiceFactory {
    ctx: Weak<NodeContext>,
    handles: Arc<RpcDispatchTable<ServiceHandle>>,
}

/// Target of the calls chained after `provider(id)`.
pub struct ServiceHandle {
    ctx: Weak<NodeContext>,
    id: Uuid,
}

fn context(ctx: &Weak<NodeContext>) -> Result<Arc<NodeContext>, String> {
    ctx.upgrade().ok_or_else(|| "node is shutting down".to_string())
}

impl CloudServiceFactory {
    /// Bound RPC target for the node's provider registry.
    pub fn target(ctx: Weak<NodeContext>) -> Arc<dyn RpcTarget> {
        let handles = Arc::new(
            RpcDispatchTable::new(SERVICE_PROVIDER_INTERFACE)
                .method(&START, |h: &ServiceHandle, _: ()| {
                    h.request(ServiceLifecycle::Running)
                })
                .method(&STOP, |h: &ServiceHandle, _: ()| {
                    h.request(ServiceLifecycle::Stopped)
                })
                .method(&DELETE, |h: &ServiceHandle, _: ()| {
                    h.request(ServiceLifecycle::Deleted)
                })
                .method(&INFO, |h: &ServiceHandle, _: ()| -> Result<Option<ServiceInfoSnapshot>, String> {
                    Ok(context(&h.ctx)?.local_services.get(&h.id))
                }),
        );
        let table = Arc::new(
            RpcDispatchTable::new(SERVICE_FACTORY_INTERFACE)
                .method(&CREATE, |f: &CloudServiceFactory, config: ServiceConfiguration| {
                    f.create(config)
                })
                .handle(&PROVIDER, |f: &CloudServiceFactory, id: Uuid| f.provider(id)),
        );
        table.bind(Arc::new(CloudServiceFactory { ctx, handles }))
    }

    fn create(&self, config: ServiceConfiguration) -> Result<ServiceInfoSnapshot, String> {
        let ctx = context(&self.ctx)?;
        if ctx.is_draining() {
            return Err(ServiceError::Draining.to_string());
        }
        let taken = ctx.services.ordinals(&config.task_name);
        let (snapshot, _secret) = ctx
            .local_services
            .create(config, &taken)
            .map_err(|e| e.to_string())?;
        crate::internal::publish_service_info(&ctx, &snapshot);
        Ok(snapshot)
    }

    fn provider(&self, id: Uuid) -> Result<Arc<dyn RpcTarget>, String> {
        let ctx = context(&self.ctx)?;
        if !ctx.local_services.contains(&id) {
            return Err(ServiceError::UnknownService(id).to_string());
        }
        Ok(self.handles.bind(Arc::new(ServiceHandle {
            ctx: self.ctx.clone(),
            id,
        })))
    }
}

impl ServiceHandle {
    fn request(&self, to: ServiceLifecycle) -> Result<(), String> {
        context(&self.ctx)?
            .local_services
            .request_lifecycle(&self.id, to)
            .map_err(|e| e.to_string())
    }
}

/// Typed client for a remote node's service factory.
#[derive(Clone)]
pub struct ServiceFactoryClient {
    sender: RpcSender,
}

impl ServiceFactoryClient {
    pub fn new(sender: RpcSender) -> Self {
        Self { sender }
    }

    pub async fn create(&self, config: &ServiceConfiguration) -> Result<ServiceInfoSnapshot, RpcError> {
        self.sender.invoke(&CREATE, config).fire().await
    }

    // Lifecycle requests return nothing, so they are sent without waiting
    // for the provider. Failures on the remote side are only logged there.

    pub fn start(&self, id: Uuid) -> Result<(), RpcError> {
        self.sender.invoke(&PROVIDER, id).then(&START, ()).fire_and_forget()
    }

    pub fn stop(&self, id: Uuid) -> Result<(), RpcError> {
        self.sender.invoke(&PROVIDER, id).then(&STOP, ()).fire_and_forget()
    }

    pub fn delete(&self, id: Uuid) -> Result<(), RpcError> {
        self.sender.invoke(&PROVIDER, id).then(&DELETE, ()).fire_and_forget()
    }

    pub async fn info(&self, id: Uuid) -> Result<Option<ServiceInfoSnapshot>, RpcError> {
        self.sender.invoke(&PROVIDER, id).then(&INFO, ()).fire().await
    }
}
