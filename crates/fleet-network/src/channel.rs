//! Channel -- an established connection to a node or a service.
//!
//! A channel owns a reader task (decode + dispatch) and a writer task (send
//! queue). Any transport that yields an `AsyncRead`/`AsyncWrite` pair can back
//! a channel: TCP sockets, QUIC bidirectional streams, in-memory duplex pipes.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{FrameCodec, Packet, PacketFlags, ProtocolError};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::query::{PendingQuery, QueryManager};
use crate::registry::PacketListenerRegistry;
use crate::{ChannelError, QueryError};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle hooks for channels created by a server or client.
pub trait ChannelHandler: Send + Sync {
    /// Runs before the first inbound packet is dispatched.
    fn on_open(&self, _channel: &Channel) {}

    /// Runs once, after the channel released its listeners and queries.
    fn on_close(&self, _channel: &Channel) {}
}

/// Handler that installs nothing.
pub struct NoopHandler;

impl ChannelHandler for NoopHandler {}

/// Addressing facts about a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub encrypted: bool,
}

struct ChannelInner {
    id: u64,
    info: ChannelInfo,
    max_frame_bytes: usize,
    listeners: PacketListenerRegistry,
    queries: QueryManager,
    outbound: mpsc::UnboundedSender<Packet>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    handler: Arc<dyn ChannelHandler>,
}

/// Cheaply cloneable handle to a live (or closed) connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.info.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Wrap a connected stream pair and start its reader and writer tasks.
    ///
    /// `handler.on_open` runs before the reader starts, so listeners it
    /// registers see the very first packet. Must be called inside a runtime.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        info: ChannelInfo,
        max_frame_bytes: usize,
        handler: Arc<dyn ChannelHandler>,
    ) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, queue) = mpsc::unbounded_channel();
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                info,
                max_frame_bytes,
                listeners: PacketListenerRegistry::new(),
                queries: QueryManager::new(),
                outbound,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                handler,
            }),
        };

        tracing::debug!(
            channel = channel.id(),
            remote = %info.remote_addr,
            encrypted = info.encrypted,
            "channel opened"
        );
        channel.inner.handler.on_open(&channel);

        let frames = FramedWrite::new(writer, FrameCodec::new(max_frame_bytes));
        tokio::spawn(write_loop(
            frames,
            queue,
            channel.inner.shutdown.clone(),
            channel.clone(),
        ));

        let frames = FramedRead::new(reader, FrameCodec::new(max_frame_bytes));
        tokio::spawn(read_loop(frames, channel.clone()));

        channel
    }

    /// Two channels connected back to back through an in-memory pipe.
    pub fn in_memory_pair(
        max_frame_bytes: usize,
        left: Arc<dyn ChannelHandler>,
        right: Arc<dyn ChannelHandler>,
    ) -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));
        let right_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 2));

        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = Channel::spawn(
            a_read,
            a_write,
            ChannelInfo {
                remote_addr: right_addr,
                local_addr: left_addr,
                encrypted: false,
            },
            max_frame_bytes,
            left,
        );
        let right = Channel::spawn(
            b_read,
            b_write,
            ChannelInfo {
                remote_addr: left_addr,
                local_addr: right_addr,
                encrypted: false,
            },
            max_frame_bytes,
            right,
        );
        (left, right)
    }

    /// Process-unique id; distinguishes a replacement connection from a stale one.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn info(&self) -> ChannelInfo {
        self.inner.info
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.info.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.info.local_addr
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.inner.max_frame_bytes
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.info.encrypted
    }

    pub fn listeners(&self) -> &PacketListenerRegistry {
        &self.inner.listeners
    }

    pub fn queries(&self) -> &QueryManager {
        &self.inner.queries
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Queue a packet. Never blocks; safe to call from listeners.
    ///
    /// A packet that would not fit in one frame is refused here and the
    /// channel stays open.
    pub fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let size = packet.encoded_len();
        if size > self.inner.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.inner.max_frame_bytes,
            }
            .into());
        }
        self.inner
            .outbound
            .send(packet)
            .map_err(|_| ChannelError::Closed)
    }

    /// Send `packet` under a fresh correlation id and wait for the response.
    pub async fn send_query(&self, packet: Packet, timeout: Duration) -> Result<Packet, QueryError> {
        let correlation = Uuid::new_v4();
        let packet = packet
            .with_correlation(correlation)
            .with_flags(PacketFlags::QUERY);

        let waiter = self.inner.queries.register(correlation);
        let _pending = PendingQuery::new(&self.inner.queries, correlation);
        self.send(packet)?;

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(QueryError::Closed),
            Err(_) => {
                tracing::debug!(
                    channel = self.id(),
                    %correlation,
                    ?timeout,
                    "query timed out"
                );
                Err(QueryError::Timeout(timeout))
            }
        }
    }

    /// Route one inbound packet: responses go to their waiter, everything
    /// else to the listener registry.
    pub fn dispatch(&self, packet: Packet) {
        if packet.is_response() {
            if let Err(late) = self.inner.queries.complete(packet) {
                tracing::debug!(
                    channel = self.id(),
                    tag = late.channel(),
                    correlation = %late.correlation(),
                    "dropping response without waiter"
                );
            }
            return;
        }

        if self.inner.listeners.dispatch(self, &packet) == 0 {
            tracing::debug!(
                channel = self.id(),
                tag = packet.channel(),
                id = packet.id(),
                "no listener for packet"
            );
        }
    }

    /// Close the channel. Idempotent: the first call releases listeners,
    /// fails pending queries and notifies the handler; later calls do nothing.
    /// Packets queued before the call are still flushed.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let failed = self.inner.queries.close_all();
        self.inner.listeners.clear();
        tracing::debug!(
            channel = self.id(),
            remote = %self.remote_addr(),
            failed_queries = failed,
            "channel closed"
        );
        self.inner.handler.on_close(self);
    }
}

async fn read_loop<R>(mut frames: FramedRead<R, FrameCodec>, channel: Channel)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = channel.inner.shutdown.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(packet)) => channel.dispatch(packet),
                Some(Err(e)) => {
                    tracing::warn!(
                        channel = channel.id(),
                        remote = %channel.remote_addr(),
                        "closing channel on decode error: {e}"
                    );
                    break;
                }
                None => {
                    tracing::debug!(channel = channel.id(), "connection closed by peer");
                    break;
                }
            },
        }
    }
    channel.close();
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, FrameCodec>,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    shutdown: CancellationToken,
    channel: Channel,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            next = queue.recv() => match next {
                Some(packet) => {
                    if let Err(e) = frames.send(packet).await {
                        tracing::warn!(channel = channel.id(), "write failed: {e}");
                        channel.close();
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(packet) = queue.try_recv() {
                    if frames.send(packet).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = frames.close().await;
}
