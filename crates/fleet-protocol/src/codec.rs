//! Varint-prefixed packet codec for TCP and QUIC streams.
//!
//! Wire format: varint body length + packet body (see [`crate::packet`]).

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::Packet;
use crate::varint::{read_varint, varint_len, write_varint};
use crate::{ProtocolError, DEFAULT_LIMITS};

/// Codec for framing packets over a byte stream.
///
/// Decoding resumes across partial reads and yields one packet per frame.
/// A declared length above `max_frame_bytes` is an error the connection
/// must treat as fatal.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_LIMITS.max_frame_bytes)
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Peek at the length prefix
        let (length, prefix_len) = match read_varint(src)? {
            Some((length, prefix_len)) => (length as usize, prefix_len),
            None => return Ok(None),
        };

        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_bytes,
            });
        }

        let total = prefix_len + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let body = src.split_to(length).freeze();
        Packet::decode_body(body).map(Some)
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.encoded_len();
        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(varint_len(length as u32) + length);
        write_varint(dst, length as u32);
        item.encode_body(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFlags;
    use bytes::Bytes;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn sample(id: u32) -> Packet {
        Packet::new("internal:test", id, Bytes::from(vec![id as u8; 32]))
            .with_correlation(Uuid::new_v4())
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = FrameCodec::default();
        let packet = sample(42).with_flags(PacketFlags::QUERY);

        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(sample(1), &mut buf).unwrap();

        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        for i in 0..5 {
            codec.encode(sample(i), &mut buf).unwrap();
        }
        for i in 0..5 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.id(), i);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        write_varint(&mut buf, 65);
        buf.extend_from_slice(&[0u8; 10]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 65, max: 64 })
        ));
    }

    #[test]
    fn test_oversized_encode_rejected() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        assert!(codec.encode(sample(1), &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_length_prefix() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedVarInt(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_frames_survive_arbitrary_splits(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..6),
            split_at in proptest::collection::vec(1usize..64, 1..32),
        ) {
            let mut codec = FrameCodec::default();
            let mut wire = BytesMut::new();
            let packets: Vec<Packet> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, p)| Packet::new(format!("tag-{i}"), i as u32, p).with_correlation(Uuid::new_v4()))
                .collect();
            for packet in &packets {
                codec.encode(packet.clone(), &mut wire).unwrap();
            }

            // Feed the stream in uneven slices, as a socket would deliver it.
            let mut decoded = Vec::new();
            let mut buf = BytesMut::new();
            let mut sizes = split_at.iter().cycle();
            while !wire.is_empty() {
                let take = (*sizes.next().unwrap()).min(wire.len());
                buf.extend_from_slice(&wire.split_to(take));
                while let Some(packet) = codec.decode(&mut buf).unwrap() {
                    decoded.push(packet);
                }
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(decoded, packets);
        }
    }
}
