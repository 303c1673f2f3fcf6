//! Peer wire messages and their length-prefixed framing.
//!
//! Every message after the handshake is `u32 BE length ‖ payload`, where a
//! zero length is a keep-alive and otherwise `payload[0]` is the message id.
//! Messages decode into pure data; the reactor applies them to the piece
//! store, so this module has no dependency on any bookkeeping type beyond
//! [`BlockRequest`].
use super::{PeerError, PeerResult};
use crate::piece::BlockRequest;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Sanity cap on the length prefix: one block plus the Piece header, with
/// headroom for a large bitfield. Anything bigger is a protocol violation.
pub const MAX_FRAME_LEN: usize = (1 << 17) + 16;

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Packed piece availability, MSB-first.
    Bitfield(Vec<u8>),
    Request(BlockRequest),
    Piece {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel(BlockRequest),
    /// DHT port announcement; accepted and ignored.
    Port(u16),
}

impl Message {
    /// Wire id of the message, `None` for keep-alive.
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_) => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel(_) => Some(8),
            Message::Port(_) => Some(9),
        }
    }
}

/// Length-prefixed codec for [`Message`], used with `FramedRead` /
/// `FramedWrite`. Decode resumes cleanly across partial reads: until a
/// complete frame is buffered it returns `Ok(None)` and leaves the input
/// untouched.
pub struct MessageCodec;

fn read_block_request(payload: &[u8], what: &'static str) -> PeerResult<BlockRequest> {
    if payload.len() != 12 {
        return Err(PeerError::MalformedPayload(what));
    }
    Ok(BlockRequest {
        index: BigEndian::read_u32(&payload[0..4]),
        begin: BigEndian::read_u32(&payload[4..8]),
        length: BigEndian::read_u32(&payload[8..12]),
    })
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> PeerResult<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = BigEndian::read_u32(&src[..4]) as usize;
        if length == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if length > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(length));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let id = src[4];
        let payload = &src[5..4 + length];

        let message = match id {
            0 | 1 | 2 | 3 => {
                if !payload.is_empty() {
                    return Err(PeerError::MalformedPayload("state"));
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if payload.len() != 4 {
                    return Err(PeerError::MalformedPayload("have"));
                }
                Message::Have(BigEndian::read_u32(payload))
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => Message::Request(read_block_request(payload, "request")?),
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedPayload("piece"));
                }
                Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    data: payload[8..].to_vec(),
                }
            }
            8 => Message::Cancel(read_block_request(payload, "cancel")?),
            9 => {
                if payload.len() != 2 {
                    return Err(PeerError::MalformedPayload("port"));
                }
                Message::Port(BigEndian::read_u16(payload))
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };

        src.advance(4 + length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> PeerResult<()> {
        let payload_len = match &item {
            Message::KeepAlive => {
                dst.put_u32(0);
                return Ok(());
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bits) => bits.len(),
            Message::Request(_) | Message::Cancel(_) => 12,
            Message::Piece { data, .. } => 8 + data.len(),
            Message::Port(_) => 2,
        };

        let length = 1 + payload_len;
        if length > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.id().expect("keep-alive handled above"));
        match item {
            Message::Have(index) => dst.put_u32(index),
            Message::Bitfield(bits) => dst.extend_from_slice(&bits),
            Message::Request(req) | Message::Cancel(req) => {
                dst.put_u32(req.index);
                dst.put_u32(req.begin);
                dst.put_u32(req.length);
            }
            Message::Piece { index, begin, data } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.extend_from_slice(&data);
            }
            Message::Port(port) => dst.put_u16(port),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).expect("encode");
        buf
    }

    fn round_trip(msg: Message) {
        let mut buf = encode_one(msg.clone());
        let wire = buf.clone();
        let decoded = MessageCodec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty(), "no residual bytes");

        // decode-then-encode reproduces the wire bytes
        assert_eq!(encode_one(decoded), wire);
    }

    #[test]
    fn round_trips_every_message_kind() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(1234));
        round_trip(Message::Bitfield(vec![0b1010_0000, 0b0000_0001]));
        round_trip(Message::Request(BlockRequest {
            index: 1,
            begin: 16_384,
            length: 16_384,
        }));
        round_trip(Message::Piece {
            index: 7,
            begin: 0,
            data: vec![0xAB; 1000],
        });
        round_trip(Message::Cancel(BlockRequest {
            index: 2,
            begin: 0,
            length: 16_384,
        }));
        round_trip(Message::Port(6881));
    }

    #[test]
    fn known_encodings() {
        assert_eq!(&encode_one(Message::KeepAlive)[..], &[0, 0, 0, 0]);
        assert_eq!(&encode_one(Message::Unchoke)[..], &[0, 0, 0, 1, 1]);
        assert_eq!(
            &encode_one(Message::Have(9))[..],
            &[0, 0, 0, 5, 4, 0, 0, 0, 9]
        );
        assert_eq!(
            &encode_one(Message::Request(BlockRequest {
                index: 1,
                begin: 2,
                length: 3,
            }))[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn resumes_across_partial_reads() {
        let full = encode_one(Message::Have(42));
        let mut buf = BytesMut::new();

        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = MessageCodec.decode(&mut buf).expect("decode");
            if i + 1 < full.len() {
                assert!(result.is_none(), "frame incomplete at byte {}", i);
            } else {
                assert_eq!(result, Some(Message::Have(42)));
            }
        }
    }

    #[test]
    fn drains_back_to_back_frames() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Unchoke, &mut buf).unwrap();
        MessageCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        MessageCodec.encode(Message::Have(3), &mut buf).unwrap();

        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Have(3)));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_u8(7);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(PeerError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn rejects_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(42);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(PeerError::UnknownMessageId(42))
        ));
    }

    #[test]
    fn rejects_malformed_payloads() {
        // Have with a 2-byte payload
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(4);
        buf.put_u16(1);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(PeerError::MalformedPayload("have"))
        ));
    }
}
