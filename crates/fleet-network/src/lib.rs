//! Fleet Network -- channels, packet routing, RPC and chunked transfer.
//!
//! One reader task per channel decodes frames and dispatches packets to the
//! channel's listener registry in arrival order; one writer task drains the
//! send queue. Listeners run on the reader task and must hand long work off.

use std::time::Duration;

pub mod channel;
pub mod chunk;
pub mod messaging;
pub mod query;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use channel::{Channel, ChannelHandler, ChannelInfo, NoopHandler};
pub use chunk::{
    ChunkError, ChunkProgress, ChunkSessionCallback, ChunkSessionRegistry, ChunkedPacketSender,
    CompletedTransfer, TransferStatus,
};
pub use messaging::{ChannelMessageListener, ChannelMessageListeners};
pub use query::QueryManager;
pub use registry::{ListenerResult, PacketListener, PacketListenerRegistry};
pub use rpc::{
    ChannelSupplier, MethodDescriptor, RpcChain, RpcDispatchTable, RpcError,
    RpcProviderRegistry, RpcSender, RpcTarget, RpcValue,
};
pub use transport::{NetworkClient, NetworkServer, TransportError, TransportSecurity};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] fleet_protocol::ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("channel closed before a response arrived")]
    Closed,
    #[error(transparent)]
    Send(#[from] ChannelError),
}

/// Which kind of process owns the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Cluster node: accepts peers and services.
    Node,
    /// Managed service process: a single channel to its node.
    Service,
}

/// Worker threads for the runtime of a process in `role`.
///
/// Services get a fixed small pool; nodes scale with the host but never
/// drop below eight.
pub fn worker_threads(role: Role) -> usize {
    match role {
        Role::Service => 4,
        Role::Node => {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (cores * 2).max(8)
        }
    }
}
