//! Node-to-node housekeeping messages on the `fleet:internal` message channel.

use std::sync::{Arc, Weak};

use fleet_network::ChannelMessageListener;
use fleet_protocol::{
    internal_messages as names, ChannelMessage, ChannelMessageSender, ChannelMessageTarget,
    ClusterDataPayload, NodeInfoSnapshot, ServiceInfoSnapshot,
};

use crate::context::NodeContext;
use crate::data::{PermissionGroup, PermissionUser};

// ============================================================================
// Receiving
// ============================================================================

pub struct InternalMessageListener {
    ctx: Weak<NodeContext>,
}

impl InternalMessageListener {
    pub fn new(ctx: Weak<NodeContext>) -> Self {
        Self { ctx }
    }

    fn apply(&self, ctx: &NodeContext, message: &ChannelMessage) -> Result<(), fleet_protocol::ProtocolError> {
        match message.message.as_str() {
            names::UPDATE_NODE_INFO => {
                let snapshot: NodeInfoSnapshot = message.decode_content()?;
                match ctx.provider.node(&snapshot.unique_id) {
                    Some(server) => server.update_node_info_snapshot(Some(snapshot)),
                    None => tracing::debug!(node = %snapshot.unique_id, "node info from unknown node"),
                }
            }
            names::CHANGE_DRAINING_STATE => {
                let draining: bool = message.decode_content()?;
                ctx.set_draining(draining);
            }
            names::CLUSTER_NODE_SHUTDOWN => {
                tracing::warn!(sender = %message.sender.name, "shutdown requested by cluster");
                ctx.trigger_shutdown();
            }
            names::SYNC_CLUSTER_DATA => {
                let payload: ClusterDataPayload = message.decode_content()?;
                let report = ctx.data_sync.apply_cluster_data(&payload);
                tracing::info!(
                    sender = %message.sender.name,
                    force = payload.force,
                    applied = report.applied,
                    failed = report.failed,
                    "cluster data synced"
                );
            }
            names::UPDATE_SERVICE_INFO => {
                let snapshot: ServiceInfoSnapshot = message.decode_content()?;
                ctx.services.update(snapshot);
            }
            // Permission changes come from whoever holds the permission
            // management and apply as sent, whatever their revision.
            names::PERMISSIONS_ADD_GROUP | names::PERMISSIONS_UPDATE_GROUP => {
                let group: PermissionGroup = message.decode_content()?;
                ctx.data.permissions.upsert(group);
            }
            names::PERMISSIONS_DELETE_GROUP => {
                let name: String = message.decode_content()?;
                ctx.data.permissions.remove(&name);
            }
            names::PERMISSIONS_SET_GROUPS => {
                let groups: Vec<PermissionGroup> = message.decode_content()?;
                ctx.data.permissions.replace_all(groups);
            }
            names::PERMISSIONS_ADD_USER | names::PERMISSIONS_UPDATE_USER => {
                let user: PermissionUser = message.decode_content()?;
                ctx.data.users.upsert(user);
            }
            names::PERMISSIONS_DELETE_USER => {
                let user: PermissionUser = message.decode_content()?;
                ctx.data.users.remove(&user.unique_id.to_string());
            }
            other => tracing::debug!(message = other, "unknown internal message"),
        }
        Ok(())
    }
}

impl ChannelMessageListener for InternalMessageListener {
    fn handle(&self, message: &ChannelMessage) -> Option<Vec<u8>> {
        if message.channel != names::CHANNEL {
            return None;
        }
        let ctx = self.ctx.upgrade()?;
        if let Err(e) = self.apply(&ctx, message) {
            tracing::warn!(
                message = %message.message,
                sender = %message.sender.name,
                "bad internal message: {e}"
            );
        }
        None
    }
}

// ============================================================================
// Sending
// ============================================================================

fn internal_message(ctx: &NodeContext, name: &str, target: ChannelMessageTarget) -> ChannelMessage {
    ChannelMessage::new(ChannelMessageSender::node(ctx.local_id()), names::CHANNEL, name).target(target)
}

fn send_json<T: serde::Serialize>(ctx: &NodeContext, name: &str, target: ChannelMessageTarget, body: &T) {
    match internal_message(ctx, name, target).json_content(body) {
        Ok(message) => {
            ctx.messenger().send(&message);
        }
        Err(e) => tracing::warn!(message = name, "failed to encode internal message: {e}"),
    }
}

/// Publish this node's info snapshot, the local node included.
pub fn publish_node_info(ctx: &NodeContext) {
    send_json(ctx, names::UPDATE_NODE_INFO, ChannelMessageTarget::AllNodes, &ctx.node_info());
}

/// Publish a service snapshot to every node, this one included.
pub fn publish_service_info(ctx: &NodeContext, snapshot: &ServiceInfoSnapshot) {
    send_json(ctx, names::UPDATE_SERVICE_INFO, ChannelMessageTarget::AllNodes, snapshot);
}

/// Send every local service snapshot to one peer.
pub fn announce_services(ctx: &NodeContext, peer: &str) {
    for snapshot in ctx.local_services.snapshots() {
        send_json(
            ctx,
            names::UPDATE_SERVICE_INFO,
            ChannelMessageTarget::Node(peer.to_string()),
            &snapshot,
        );
    }
}

pub fn change_draining_state(ctx: &NodeContext, node: &str, draining: bool) {
    send_json(
        ctx,
        names::CHANGE_DRAINING_STATE,
        ChannelMessageTarget::Node(node.to_string()),
        &draining,
    );
}

pub fn shutdown_node(ctx: &NodeContext, node: &str) {
    let message = internal_message(ctx, names::CLUSTER_NODE_SHUTDOWN, ChannelMessageTarget::Node(node.to_string()));
    ctx.messenger().send(&message);
}

/// Push this node's cluster data to `node`. Returns false when the node is
/// unknown or has no channel.
pub fn sync_cluster_data(ctx: &NodeContext, node: &str, force: bool) -> bool {
    let Some(server) = ctx.provider.node(node) else {
        return false;
    };
    let payload = ctx.data_sync.prepare_cluster_data(node, force);
    match server.sync_cluster_data(ctx.local_id(), &payload) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(node, "cluster data sync failed: {e}");
            false
        }
    }
}

// Permission broadcasts reach every node, this one included, so the local
// store changes through the same path as the remote ones.

pub fn add_permission_group(ctx: &NodeContext, group: &PermissionGroup) {
    send_json(ctx, names::PERMISSIONS_ADD_GROUP, ChannelMessageTarget::AllNodes, group);
}

pub fn update_permission_group(ctx: &NodeContext, group: &PermissionGroup) {
    send_json(ctx, names::PERMISSIONS_UPDATE_GROUP, ChannelMessageTarget::AllNodes, group);
}

pub fn delete_permission_group(ctx: &NodeContext, name: &str) {
    send_json(ctx, names::PERMISSIONS_DELETE_GROUP, ChannelMessageTarget::AllNodes, &name);
}

/// Replace the permission groups of every node with `groups`.
pub fn set_permission_groups(ctx: &NodeContext, groups: &[PermissionGroup]) {
    send_json(ctx, names::PERMISSIONS_SET_GROUPS, ChannelMessageTarget::AllNodes, &groups);
}

pub fn add_permission_user(ctx: &NodeContext, user: &PermissionUser) {
    send_json(ctx, names::PERMISSIONS_ADD_USER, ChannelMessageTarget::AllNodes, user);
}

pub fn update_permission_user(ctx: &NodeContext, user: &PermissionUser) {
    send_json(ctx, names::PERMISSIONS_UPDATE_USER, ChannelMessageTarget::AllNodes, user);
}

pub fn delete_permission_user(ctx: &NodeContext, user: &PermissionUser) {
    send_json(ctx, names::PERMISSIONS_DELETE_USER, ChannelMessageTarget::AllNodes, user);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;

    fn group(name: &str, revision: u64) -> PermissionGroup {
        PermissionGroup {
            name: name.into(),
            potency: 10,
            default_group: false,
            permissions: vec!["fleet.command".into()],
            revision,
        }
    }

    fn user(name: &str) -> PermissionUser {
        PermissionUser {
            unique_id: uuid::Uuid::new_v4(),
            name: name.into(),
            potency: 0,
            groups: vec!["admin".into()],
            permissions: vec![],
            revision: 0,
        }
    }

    #[tokio::test]
    async fn test_permission_broadcast_applies_locally() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());

        add_permission_group(&ctx, &group("admin", 2));
        assert_eq!(ctx.data.permissions.get("admin").unwrap().revision, 2);

        delete_permission_group(&ctx, "admin");
        assert!(ctx.data.permissions.get("admin").is_none());
    }

    #[tokio::test]
    async fn test_permission_update_applies_at_same_revision() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let mut admin = group("admin", 3);
        update_permission_group(&ctx, &admin);

        admin.permissions = vec![];
        update_permission_group(&ctx, &admin);
        assert!(ctx.data.permissions.get("admin").unwrap().permissions.is_empty());

        // An update carrying an older revision still applies.
        admin.revision = 1;
        admin.potency = 99;
        update_permission_group(&ctx, &admin);
        assert_eq!(ctx.data.permissions.get("admin").unwrap().potency, 99);
    }

    #[tokio::test]
    async fn test_set_permission_groups_replaces_all() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        add_permission_group(&ctx, &group("admin", 1));
        add_permission_group(&ctx, &group("mod", 1));

        set_permission_groups(&ctx, &[group("default", 1), group("admin", 1)]);
        let mut names: Vec<_> = ctx.data.permissions.values().into_iter().map(|g| g.name).collect();
        names.sort();
        assert_eq!(names, vec!["admin", "default"]);
    }

    #[tokio::test]
    async fn test_permission_user_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let mut alice = user("alice");
        let key = alice.unique_id.to_string();

        add_permission_user(&ctx, &alice);
        assert_eq!(ctx.data.users.get(&key).unwrap().name, "alice");

        alice.permissions = vec!["fleet.command.service".into()];
        update_permission_user(&ctx, &alice);
        assert_eq!(ctx.data.users.get(&key).unwrap().permissions.len(), 1);

        delete_permission_user(&ctx, &alice);
        assert!(ctx.data.users.get(&key).is_none());
        // Users are not part of the cluster data.
        assert!(!ctx.data_sync.keys().iter().any(|k| k == crate::data::PERMISSION_USERS_KEY));
    }

    #[tokio::test]
    async fn test_draining_message_for_self() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        change_draining_state(&ctx, "node-1", true);
        assert!(ctx.is_draining());
        change_draining_state(&ctx, "node-1", false);
        assert!(!ctx.is_draining());
    }

    #[tokio::test]
    async fn test_shutdown_message_for_self() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let mut rx = ctx.subscribe_shutdown();
        shutdown_node(&ctx, "node-1");
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_messages_on_other_channels_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let message = ChannelMessage::new(ChannelMessageSender::node("node-2"), "game", names::CHANGE_DRAINING_STATE)
            .target(ChannelMessageTarget::AllNodes)
            .json_content(&true)
            .unwrap();
        ctx.channel_messages.deliver(&message);
        assert!(!ctx.is_draining());
    }

    #[tokio::test]
    async fn test_sync_to_disconnected_node_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        assert!(!sync_cluster_data(&ctx, "node-2", true));
        assert!(!sync_cluster_data(&ctx, "node-9", true));
    }
}
