//! Snapshots of nodes and services as they travel between nodes.
//!
//! Snapshots are immutable values. Every service snapshot carries a revision
//! and consumers keep whichever copy has the higher one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::NodeId;

/// Identity of a managed service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    /// Ordinal of the service within its task (`lobby-1`, `lobby-2`, ...).
    pub task_service_id: u32,
    pub node_unique_id: NodeId,
}

impl ServiceId {
    /// Human-readable name: `<task>-<ordinal>`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifecycle {
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceLifecycle::Prepared => "prepared",
            ServiceLifecycle::Running => "running",
            ServiceLifecycle::Stopped => "stopped",
            ServiceLifecycle::Deleted => "deleted",
        }
    }
}

/// Request to create a service on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub task_name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Fixed ordinal; the node picks the next free one when absent.
    #[serde(default)]
    pub task_service_id: Option<u32>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Versioned state of one managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfoSnapshot {
    pub service_id: ServiceId,
    pub lifecycle: ServiceLifecycle,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Whether the service process holds an authenticated channel.
    pub connected: bool,
    /// Milliseconds since the unix epoch.
    pub created_at: i64,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub revision: u64,
}

impl ServiceInfoSnapshot {
    /// True when `self` should replace `current`.
    pub fn supersedes(&self, current: &ServiceInfoSnapshot) -> bool {
        self.revision > current.revision
    }
}

/// Periodically published state of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoSnapshot {
    pub unique_id: NodeId,
    /// Milliseconds since the unix epoch.
    pub startup_millis: i64,
    /// Milliseconds since the unix epoch.
    pub creation_millis: i64,
    pub draining: bool,
    pub local_services: u32,
    pub running_services: u32,
}
