//! Packets -- the unit the router dispatches.
//!
//! Body layout (after the frame length prefix):
//!   [tag length varint][tag UTF-8][id varint][correlation 16 bytes][flags u8][payload]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::varint::{take_varint, varint_len, write_varint};
use crate::ProtocolError;

/// Bytes taken by the correlation id.
const CORRELATION_LEN: usize = 16;

/// Per-packet flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// The packet answers a query carrying the same correlation id.
    pub const RESPONSE: PacketFlags = PacketFlags(0x01);
    /// The sender is waiting for a response.
    pub const QUERY: PacketFlags = PacketFlags(0x02);

    pub const fn from_bits(bits: u8) -> Self {
        PacketFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: PacketFlags) -> Self {
        PacketFlags(self.0 | other.0)
    }
}

/// An immutable framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    channel: String,
    id: u32,
    correlation: Uuid,
    flags: PacketFlags,
    payload: Bytes,
}

impl Packet {
    pub fn new(channel: impl Into<String>, id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            id,
            correlation: Uuid::nil(),
            flags: PacketFlags::NONE,
            payload: payload.into(),
        }
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize>(
        channel: impl Into<String>,
        id: u32,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(channel, id, payload))
    }

    /// A response to `request`: same tag, id and correlation, RESPONSE flag set.
    pub fn response_to(request: &Packet, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: request.channel.clone(),
            id: request.id,
            correlation: request.correlation,
            flags: PacketFlags::RESPONSE,
            payload: payload.into(),
        }
    }

    /// JSON-encoded response to `request`.
    pub fn json_response_to<T: Serialize>(
        request: &Packet,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::response_to(request, payload))
    }

    pub fn with_correlation(mut self, correlation: Uuid) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = self.flags.with(flags);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn correlation(&self) -> Uuid {
        self.correlation
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(PacketFlags::RESPONSE)
    }

    pub fn is_query(&self) -> bool {
        self.flags.contains(PacketFlags::QUERY)
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Length of the encoded body (everything the frame prefix covers).
    pub fn encoded_len(&self) -> usize {
        let tag_len = self.channel.len();
        varint_len(tag_len as u32)
            + tag_len
            + varint_len(self.id)
            + CORRELATION_LEN
            + 1
            + self.payload.len()
    }

    /// Write the body into `dst`. The caller writes the frame prefix.
    pub fn encode_body(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        write_varint(dst, self.channel.len() as u32);
        dst.put_slice(self.channel.as_bytes());
        write_varint(dst, self.id);
        dst.put_slice(self.correlation.as_bytes());
        dst.put_u8(self.flags.bits());
        dst.put_slice(&self.payload);
    }

    /// Parse a complete body. Any truncation or invalid tag is malformed.
    pub fn decode_body(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut cursor: &[u8] = &body;
        let tag_len = take_varint(&mut cursor)? as usize;
        if cursor.len() < tag_len {
            return Err(ProtocolError::MalformedHeader(format!(
                "channel tag needs {tag_len} bytes, {} left",
                cursor.len()
            )));
        }
        let channel = std::str::from_utf8(&cursor[..tag_len])
            .map_err(|e| ProtocolError::MalformedHeader(format!("channel tag: {e}")))?
            .to_string();
        cursor = &cursor[tag_len..];

        let id = take_varint(&mut cursor)?;

        if cursor.len() < CORRELATION_LEN + 1 {
            return Err(ProtocolError::MalformedHeader(
                "truncated correlation id or flags".into(),
            ));
        }
        let mut correlation = [0u8; CORRELATION_LEN];
        correlation.copy_from_slice(&cursor[..CORRELATION_LEN]);
        let flags = PacketFlags::from_bits(cursor[CORRELATION_LEN]);
        cursor = &cursor[CORRELATION_LEN + 1..];

        let header_len = body.len() - cursor.len();
        body.advance(header_len);

        Ok(Self {
            channel,
            id,
            correlation: Uuid::from_bytes(correlation),
            flags,
            payload: body,
        })
    }
}
