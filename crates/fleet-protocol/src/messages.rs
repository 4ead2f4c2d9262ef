//! Wire payload types for every internal channel tag.
//!
//! Payloads are serde JSON unless noted otherwise. Opaque byte fields are
//! carried as base64 strings.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::{ServiceId, ServiceInfoSnapshot};
use crate::varint::{take_varint, write_varint};
use crate::{NodeId, ProtocolError};

/// Channel tags used by the cluster itself.
pub mod tags {
    pub const AUTH: &str = "internal:auth";
    pub const SERVICE_SYNC_ACK: &str = "internal:service_sync_ack";
    pub const RPC: &str = "internal:rpc";
    pub const CHANNEL_MESSAGE: &str = "internal:channel_message";
    pub const CHUNKED_TRANSFER: &str = "internal:chunked_transfer";
}

/// Packet id used on every internal tag. Tags carry one packet kind each;
/// responses reuse the id and set the RESPONSE flag.
pub const INTERNAL_PACKET_ID: u32 = 1;

/// Channel messages the nodes exchange among themselves.
pub mod internal_messages {
    /// Message channel carrying every name below.
    pub const CHANNEL: &str = "fleet:internal";

    /// Content: `NodeInfoSnapshot`.
    pub const UPDATE_NODE_INFO: &str = "update_node_info";
    /// Content: `bool`.
    pub const CHANGE_DRAINING_STATE: &str = "change_draining_state";
    /// No content.
    pub const CLUSTER_NODE_SHUTDOWN: &str = "cluster_node_shutdown";
    /// Content: `ClusterDataPayload`.
    pub const SYNC_CLUSTER_DATA: &str = "sync_cluster_data";
    /// Content: `ServiceInfoSnapshot`.
    pub const UPDATE_SERVICE_INFO: &str = "update_service_info";
    /// Content: a permission group.
    pub const PERMISSIONS_ADD_GROUP: &str = "permissions_add_group";
    /// Content: a permission group.
    pub const PERMISSIONS_UPDATE_GROUP: &str = "permissions_update_group";
    /// Content: the group name.
    pub const PERMISSIONS_DELETE_GROUP: &str = "permissions_delete_group";
    /// Content: the complete list of permission groups.
    pub const PERMISSIONS_SET_GROUPS: &str = "permissions_set_groups";
    /// Content: a permission user.
    pub const PERMISSIONS_ADD_USER: &str = "permissions_add_user";
    /// Content: a permission user.
    pub const PERMISSIONS_UPDATE_USER: &str = "permissions_update_user";
    /// Content: a permission user.
    pub const PERMISSIONS_DELETE_USER: &str = "permissions_delete_user";
}

// ============================================================================
// Authorization
// ============================================================================

/// A node as it describes itself to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkClusterNode {
    pub unique_id: NodeId,
    #[serde(default)]
    pub listeners: Vec<String>,
}

/// First packet on every connection, discriminated by who is connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthRequest {
    Node {
        cluster_id: Uuid,
        node: NetworkClusterNode,
    },
    Service {
        connection_secret: String,
        service_id: ServiceId,
    },
}

impl AuthRequest {
    pub fn mode(&self) -> &'static str {
        match self {
            AuthRequest::Node { .. } => "node",
            AuthRequest::Service { .. } => "service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    /// The responder remembered the initiator as disconnected.
    pub reconnect: bool,
    /// Forced cluster data, present only when `reconnect` is set.
    #[serde(default)]
    pub sync_payload: Option<ClusterDataPayload>,
}

impl AuthResponse {
    pub fn accepted(reconnect: bool, sync_payload: Option<ClusterDataPayload>) -> Self {
        Self {
            success: true,
            reconnect,
            sync_payload,
        }
    }

    /// Carries no cause; the responder only logs it.
    pub fn rejected() -> Self {
        Self {
            success: false,
            reconnect: false,
            sync_payload: None,
        }
    }
}

/// Sent by a reconnecting node after it applied the forced cluster data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSyncAck {
    pub services: Vec<ServiceInfoSnapshot>,
}

// ============================================================================
// Cluster data
// ============================================================================

/// Serialized state of every registered sync domain, in handler order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDataPayload {
    pub force: bool,
    pub chunks: Vec<ClusterDataChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDataChunk {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

// ============================================================================
// RPC
// ============================================================================

/// A chain of calls: the first runs on `target`, each following call runs on
/// the handle the previous one returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub target: String,
    pub calls: Vec<RpcCall>,
    pub expects_result: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    /// Method name, for diagnostics only; dispatch uses the fingerprint.
    pub method: String,
    pub fingerprint: u64,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RpcResponse {
    Success { value: serde_json::Value },
    Failure(RpcFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub kind: RpcFailureKind,
    pub message: String,
}

impl RpcFailure {
    pub fn new(kind: RpcFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcFailureKind {
    UnknownTarget,
    UnknownMethod,
    /// A chained call met a plain value, or the chain ended on a handle.
    ChainMismatch,
    BadArguments,
    /// The invoked method itself failed.
    Remote,
}

impl RpcFailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            RpcFailureKind::UnknownTarget => "unknown_target",
            RpcFailureKind::UnknownMethod => "unknown_method",
            RpcFailureKind::ChainMismatch => "chain_mismatch",
            RpcFailureKind::BadArguments => "bad_arguments",
            RpcFailureKind::Remote => "remote",
        }
    }
}

// ============================================================================
// Channel messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Node,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessageSender {
    pub name: String,
    pub kind: SenderKind,
}

impl ChannelMessageSender {
    pub fn node(id: impl Into<String>) -> Self {
        Self {
            name: id.into(),
            kind: SenderKind::Node,
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SenderKind::Service,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ChannelMessageTarget {
    AllNodes,
    AllServices,
    Node(NodeId),
    /// A service by its `<task>-<ordinal>` name.
    Service(String),
    Task(String),
    Group(String),
}

/// A named message routed to nodes and services by target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender: ChannelMessageSender,
    pub channel: String,
    pub message: String,
    #[serde(default, with = "base64_bytes")]
    pub content: Vec<u8>,
    pub targets: Vec<ChannelMessageTarget>,
}

impl ChannelMessage {
    pub fn new(
        sender: ChannelMessageSender,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            channel: channel.into(),
            message: message.into(),
            content: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn target(mut self, target: ChannelMessageTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    pub fn json_content<T: Serialize>(mut self, body: &T) -> Result<Self, ProtocolError> {
        self.content = serde_json::to_vec(body)?;
        Ok(self)
    }

    pub fn decode_content<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.content)?)
    }
}

/// Answer to a channel message sent as a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessageReply {
    #[serde(default, with = "option_base64_bytes")]
    pub content: Option<Vec<u8>>,
}

// ============================================================================
// Chunked transfer
// ============================================================================

/// Describes one transfer; repeated in every chunk of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSessionInfo {
    pub session_id: Uuid,
    /// Selects the completion callback on the receiver.
    pub transfer_channel: String,
    pub chunk_size: u32,
    /// Opaque to the transfer layer; interpreted by the callback.
    #[serde(default, with = "base64_bytes")]
    pub header: Vec<u8>,
    /// Length of the whole transfer, when the sender knows it up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub session: ChunkSessionInfo,
    /// Byte offset of this chunk's data within the transfer.
    pub offset: u64,
    pub is_final: bool,
}

/// Chunk payload: [varint header length][JSON header][raw data].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPacket {
    pub header: ChunkHeader,
    pub data: Bytes,
}

impl ChunkPacket {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let header = serde_json::to_vec(&self.header)?;
        let mut buf = BytesMut::with_capacity(header.len() + self.data.len() + 5);
        write_varint(&mut buf, header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut cursor: &[u8] = payload;
        let header_len = take_varint(&mut cursor)? as usize;
        if cursor.len() < header_len {
            return Err(ProtocolError::MalformedHeader(format!(
                "chunk header needs {header_len} bytes, {} left",
                cursor.len()
            )));
        }
        let header: ChunkHeader = serde_json::from_slice(&cursor[..header_len])?;
        let data_start = payload.len() - cursor.len() + header_len;
        Ok(Self {
            header,
            data: payload.slice(data_start..),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod option_base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
