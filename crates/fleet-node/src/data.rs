//! Cluster-wide configuration domains kept in sync between nodes.
//!
//! Groups go first so tasks referencing them apply on top of a complete
//! group set; permissions come last. Permission users are not part of the
//! cluster data: nodes only learn them from the permission broadcasts.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_storage::ServiceTemplate;
use fleet_sync::{DataSyncRegistry, Versioned, VersionedStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const GROUPS_KEY: &str = "groups";
pub const TASKS_KEY: &str = "tasks";
pub const PERMISSIONS_KEY: &str = "permission_groups";
pub const PERMISSION_USERS_KEY: &str = "permission_users";

/// Settings shared by every task in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub revision: u64,
}

/// Blueprint services are created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default = "default_max_heap")]
    pub max_heap_memory: u32,
    #[serde(default)]
    pub min_service_count: u32,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub revision: u64,
}

fn default_max_heap() -> u32 {
    512
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionUser {
    pub unique_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub potency: i32,
    /// Names of the permission groups the user is in.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGroup {
    pub name: String,
    #[serde(default)]
    pub potency: i32,
    #[serde(default)]
    pub default_group: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub revision: u64,
}

impl Versioned for GroupConfig {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl Versioned for TaskConfig {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl Versioned for PermissionUser {
    fn key(&self) -> String {
        self.unique_id.to_string()
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl Versioned for PermissionGroup {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

/// The synced stores of one node.
pub struct ClusterData {
    pub groups: Arc<VersionedStore<GroupConfig>>,
    pub tasks: Arc<VersionedStore<TaskConfig>>,
    pub permissions: Arc<VersionedStore<PermissionGroup>>,
    pub users: Arc<VersionedStore<PermissionUser>>,
}

impl Default for ClusterData {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterData {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(VersionedStore::new(GROUPS_KEY, 0)),
            tasks: Arc::new(VersionedStore::new(TASKS_KEY, 10)),
            permissions: Arc::new(VersionedStore::new(PERMISSIONS_KEY, 20)),
            users: Arc::new(VersionedStore::new(PERMISSION_USERS_KEY, 30)),
        }
    }

    /// Register every synced store with `registry`.
    pub fn register(&self, registry: &DataSyncRegistry) {
        registry.register(self.groups.clone());
        registry.register(self.tasks.clone());
        registry.register(self.permissions.clone());
    }
}
