//! Chunked transfer -- streams large payloads as a sequence of packets.
//!
//! The sender splits a byte stream into chunks of `chunk_size` bytes, each
//! carrying the session descriptor and its offset, and flags the last one.
//! The receiver appends chunks to a temporary sink in offset order, buffers
//! chunks that arrive early, and hands the finished sink to the callback
//! registered for the session's transfer channel, exactly once. Completed
//! session ids are remembered for a while so redelivered chunks of a finished
//! session are dropped instead of opening it again.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fleet_protocol::{
    tags, ChunkHeader, ChunkPacket, ChunkSessionInfo, Packet, ProtocolError, DEFAULT_LIMITS,
    INTERNAL_PACKET_ID,
};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::channel::Channel;
use crate::registry::{ListenerResult, PacketListener};
use crate::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("no callback registered for transfer channel {0}")]
    UnknownTransferChannel(String),
    #[error("chunk at offset {offset} lies beyond the final offset {end}")]
    OffsetBeyondEnd { offset: u64, end: u64 },
    #[error("completion callback failed: {0}")]
    Callback(String),
}

/// Consumes a finished transfer. `data` is positioned at its start.
pub trait ChunkSessionCallback: Send + Sync {
    fn complete(&self, info: &ChunkSessionInfo, data: &mut File) -> Result<(), ChunkError>;
}

impl<F> ChunkSessionCallback for F
where
    F: Fn(&ChunkSessionInfo, &mut File) -> Result<(), ChunkError> + Send + Sync,
{
    fn complete(&self, info: &ChunkSessionInfo, data: &mut File) -> Result<(), ChunkError> {
        self(info, data)
    }
}

// ============================================================================
// Receiver
// ============================================================================

struct ChunkSession {
    info: ChunkSessionInfo,
    sink: File,
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    final_end: Option<u64>,
    /// Announced total size, if any.
    limit: Option<u64>,
    last_activity: Instant,
}

impl ChunkSession {
    fn new(info: ChunkSessionInfo) -> Result<Self, ChunkError> {
        Ok(Self {
            sink: tempfile::tempfile()?,
            next_offset: 0,
            pending: BTreeMap::new(),
            final_end: None,
            limit: info.total_size,
            info,
            last_activity: Instant::now(),
        })
    }

    /// Write whatever part of the chunk starting at `offset` lies past the
    /// contiguous prefix already written.
    fn append(&mut self, offset: u64, data: &[u8]) -> Result<(), ChunkError> {
        let end = offset + data.len() as u64;
        if end <= self.next_offset {
            return Ok(());
        }
        let skip = (self.next_offset - offset) as usize;
        self.sink.write_all(&data[skip..])?;
        self.next_offset = end;
        Ok(())
    }

    fn accept(&mut self, header: &ChunkHeader, data: Bytes) -> Result<bool, ChunkError> {
        self.last_activity = Instant::now();
        let end = header.offset + data.len() as u64;

        if header.is_final {
            self.final_end = Some(end);
        }
        if let Some(bound) = self.final_end.or(self.limit) {
            if end > bound {
                return Err(ChunkError::OffsetBeyondEnd {
                    offset: header.offset,
                    end: bound,
                });
            }
        }

        if header.offset <= self.next_offset {
            self.append(header.offset, &data)?;
            while let Some(entry) = self.pending.first_entry() {
                if *entry.key() > self.next_offset {
                    break;
                }
                let (offset, data) = entry.remove_entry();
                self.append(offset, &data)?;
            }
        } else {
            self.pending.entry(header.offset).or_insert(data);
        }

        Ok(self.final_end == Some(self.next_offset))
    }
}

/// Completed session ids kept at most, oldest evicted first.
const MAX_COMPLETED_SESSIONS: usize = 1024;

/// Outcome of feeding one chunk to the registry.
pub enum ChunkProgress {
    Buffered,
    Complete(CompletedTransfer),
    /// The chunk belongs to a session that already completed.
    Duplicate,
}

/// A finished session, detached from the registry and ready for its callback.
pub struct CompletedTransfer {
    info: ChunkSessionInfo,
    sink: File,
    callback: Arc<dyn ChunkSessionCallback>,
}

impl CompletedTransfer {
    pub fn info(&self) -> &ChunkSessionInfo {
        &self.info
    }

    /// Invoke the callback. Blocking; run it off the reader task.
    pub fn run(mut self) -> Result<(), ChunkError> {
        self.sink.flush()?;
        self.sink.seek(SeekFrom::Start(0))?;
        self.callback.complete(&self.info, &mut self.sink)
    }
}

/// Ids of completed sessions in completion order.
#[derive(Default)]
struct CompletedSessions {
    order: VecDeque<(Uuid, Instant)>,
    ids: HashSet<Uuid>,
}

impl CompletedSessions {
    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.order.len() >= MAX_COMPLETED_SESSIONS {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        if self.ids.insert(id) {
            self.order.push_back((id, Instant::now()));
        }
    }

    fn forget_older_than(&mut self, age: Duration) {
        while let Some((id, at)) = self.order.front().copied() {
            if at.elapsed() < age {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct RegistryInner {
    callbacks: RwLock<HashMap<String, Arc<dyn ChunkSessionCallback>>>,
    sessions: Mutex<HashMap<Uuid, ChunkSession>>,
    completed: Mutex<CompletedSessions>,
    timeout: Duration,
}

/// Receiving side of chunked transfers for one process.
#[derive(Clone)]
pub struct ChunkSessionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ChunkSessionRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            DEFAULT_LIMITS.chunk_session_timeout_secs,
        ))
    }
}

impl ChunkSessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                callbacks: RwLock::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                completed: Mutex::new(CompletedSessions::default()),
                timeout,
            }),
        }
    }

    pub fn register_callback(
        &self,
        transfer_channel: impl Into<String>,
        callback: Arc<dyn ChunkSessionCallback>,
    ) {
        self.inner
            .callbacks
            .write()
            .insert(transfer_channel.into(), callback);
    }

    /// Feed one chunk. The session leaves the registry before its callback
    /// can run and its id is tombstoned, so a completed session never
    /// completes twice.
    pub fn accept(&self, chunk: ChunkPacket) -> Result<ChunkProgress, ChunkError> {
        let ChunkPacket { header, data } = chunk;
        let session_id = header.session.session_id;
        let callback = self
            .inner
            .callbacks
            .read()
            .get(&header.session.transfer_channel)
            .cloned()
            .ok_or_else(|| {
                ChunkError::UnknownTransferChannel(header.session.transfer_channel.clone())
            })?;

        // Lock order: sessions, then completed.
        let mut sessions = self.inner.sessions.lock();
        if self.inner.completed.lock().contains(&session_id) {
            tracing::debug!(session = %session_id, offset = header.offset, "chunk of a completed session dropped");
            return Ok(ChunkProgress::Duplicate);
        }
        if !sessions.contains_key(&session_id) {
            tracing::debug!(
                session = %session_id,
                transfer_channel = %header.session.transfer_channel,
                "chunk session started"
            );
            sessions.insert(session_id, ChunkSession::new(header.session.clone())?);
        }
        let Some(session) = sessions.get_mut(&session_id) else {
            return Ok(ChunkProgress::Buffered);
        };

        let complete = match session.accept(&header, data) {
            Ok(complete) => complete,
            Err(e) => {
                sessions.remove(&session_id);
                return Err(e);
            }
        };
        if !complete {
            return Ok(ChunkProgress::Buffered);
        }

        let Some(session) = sessions.remove(&session_id) else {
            return Ok(ChunkProgress::Buffered);
        };
        self.inner.completed.lock().insert(session_id);
        tracing::debug!(
            session = %session_id,
            bytes = session.next_offset,
            "chunk session complete"
        );
        Ok(ChunkProgress::Complete(CompletedTransfer {
            info: session.info,
            sink: session.sink,
            callback,
        }))
    }

    /// Drop sessions idle for longer than the timeout, and forget sessions
    /// that completed longer than the timeout ago.
    pub fn reap_expired(&self) -> usize {
        let timeout = self.inner.timeout;
        self.inner.completed.lock().forget_older_than(timeout);
        let mut sessions = self.inner.sessions.lock();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let alive = session.last_activity.elapsed() < timeout;
            if !alive {
                tracing::warn!(
                    session = %id,
                    transfer_channel = %session.info.transfer_channel,
                    received = session.next_offset,
                    "chunk session expired"
                );
            }
            alive
        });
        before - sessions.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn completed_sessions(&self) -> usize {
        self.inner.completed.lock().len()
    }
}

impl PacketListener for ChunkSessionRegistry {
    fn handle(&self, _channel: &Channel, packet: &Packet) -> ListenerResult {
        let chunk = ChunkPacket::decode(packet.payload())?;
        if let ChunkProgress::Complete(completed) = self.accept(chunk)? {
            tokio::task::spawn_blocking(move || {
                let session = completed.info().session_id;
                let transfer_channel = completed.info().transfer_channel.clone();
                if let Err(e) = completed.run() {
                    tracing::warn!(%session, %transfer_channel, "chunk callback failed: {e}");
                }
            });
        }
        Ok(())
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Totals for a finished send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub session_id: Uuid,
    pub bytes: u64,
    pub chunks: u32,
}

/// Sends one stream as a chunked transfer over a channel.
pub struct ChunkedPacketSender {
    channel: Channel,
    info: ChunkSessionInfo,
}

impl ChunkedPacketSender {
    pub fn new(channel: Channel, transfer_channel: impl Into<String>, header: Vec<u8>) -> Self {
        Self {
            channel,
            info: ChunkSessionInfo {
                session_id: Uuid::new_v4(),
                transfer_channel: transfer_channel.into(),
                chunk_size: DEFAULT_LIMITS.chunk_size as u32,
                header,
                total_size: None,
            },
        }
    }

    pub fn chunk_size(mut self, chunk_size: u32) -> Self {
        self.info.chunk_size = chunk_size.max(1);
        self
    }

    /// Announce the length of the stream. The receiver refuses data past it.
    pub fn total_size(mut self, total_size: u64) -> Self {
        self.info.total_size = Some(total_size);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.info.session_id
    }

    /// Stream `source` to the peer. An empty source still sends one final,
    /// empty chunk so the receiver completes.
    pub async fn send<R>(self, mut source: R) -> Result<TransferStatus, ChunkError>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = self.info.chunk_size as usize;
        let mut current = read_chunk(&mut source, chunk_size).await?;
        let mut offset = 0u64;
        let mut chunks = 0u32;

        loop {
            // Read ahead so the final flag lands on the last data chunk.
            let next = if current.len() == chunk_size {
                read_chunk(&mut source, chunk_size).await?
            } else {
                Vec::new()
            };
            let is_final = next.is_empty();
            let len = current.len() as u64;

            let chunk = ChunkPacket {
                header: ChunkHeader {
                    session: self.info.clone(),
                    offset,
                    is_final,
                },
                data: Bytes::from(current),
            };
            self.channel.send(Packet::new(
                tags::CHUNKED_TRANSFER,
                INTERNAL_PACKET_ID,
                chunk.encode()?,
            ))?;
            offset += len;
            chunks += 1;

            if is_final {
                break;
            }
            current = next;
        }

        tracing::debug!(
            session = %self.info.session_id,
            transfer_channel = %self.info.transfer_channel,
            bytes = offset,
            chunks,
            "chunked transfer sent"
        );
        Ok(TransferStatus {
            session_id: self.info.session_id,
            bytes: offset,
            chunks,
        })
    }
}

/// Fill up to `size` bytes; shorter only at end of stream.
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, size: usize) -> Result<Vec<u8>, ChunkError> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
