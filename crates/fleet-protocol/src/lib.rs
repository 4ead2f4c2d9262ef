//! Fleet Protocol -- wire frames, packets and payload types.
//!
//! TCP between nodes and services, QUIC when encryption is enabled.
//! Varint length prefix + packet header + payload (serde JSON for most tags).

pub mod codec;
pub mod limits;
pub mod messages;
pub mod packet;
pub mod snapshot;
pub mod tls;
pub mod varint;

pub use codec::FrameCodec;
pub use limits::{ProtocolLimits, DEFAULT_LIMITS};
pub use messages::*;
pub use packet::{Packet, PacketFlags};
pub use snapshot::*;

/// Unique id of a node within its cluster (`node-1`, ...).
pub type NodeId = String;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed varint: {0}")]
    MalformedVarInt(&'static str),
    #[error("malformed packet header: {0}")]
    MalformedHeader(String),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
