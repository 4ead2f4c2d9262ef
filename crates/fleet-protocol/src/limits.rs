//! Protocol limits -- parameters every node in a cluster must agree on.
//!
//! Worker pool sizes and listener addresses are node-local decisions and
//! NOT part of this set.

/// Wire and timing limits shared by every node in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolLimits {
    // -- Framing --
    /// Largest packet body a frame may declare.
    pub max_frame_bytes: usize,

    // -- Queries --
    /// Default wait for a query or RPC response, in seconds.
    pub query_timeout_secs: u64,
    /// Wait for the peer's answer to an authorization request, in seconds.
    pub auth_timeout_secs: u64,

    // -- Chunked transfer --
    /// Payload bytes per chunk packet.
    pub chunk_size: usize,
    /// Seconds a chunk session may stay idle before it is dropped.
    pub chunk_session_timeout_secs: u64,

    // -- Scheduling --
    /// Tick loop interval in milliseconds (20 ticks per second).
    pub tick_interval_ms: u64,
    /// Node info snapshot publication interval, in ticks.
    pub node_info_publish_ticks: u64,
    /// Seconds without a node info update before a ready peer is closed.
    pub node_stale_timeout_secs: u64,
    /// Seconds between reconnect attempts to configured peers.
    pub reconnect_interval_secs: u64,
}

impl ProtocolLimits {
    /// Ticks that fit into the stale timeout.
    pub const fn stale_timeout_ticks(&self) -> u64 {
        self.node_stale_timeout_secs * 1000 / self.tick_interval_ms
    }
}

/// Defaults for a small cluster on a trusted network.
pub const DEFAULT_LIMITS: ProtocolLimits = ProtocolLimits {
    // Framing
    max_frame_bytes: 8 * 1024 * 1024,

    // Queries
    query_timeout_secs: 30,
    auth_timeout_secs: 10,

    // Chunked transfer
    chunk_size: 50 * 1024,
    chunk_session_timeout_secs: 60,

    // Scheduling
    tick_interval_ms: 50,
    node_info_publish_ticks: 20, // 1s at 50ms tick
    node_stale_timeout_secs: 30,
    reconnect_interval_secs: 5,
};
