//! The wire codec: the one-time handshake and the framed peer protocol
//! messages that follow it (spec.md §4.4, §4.5).
//!
//! `HandshakeCodec` and `PeerCodec` are plain `tokio_util::codec`
//! `Encoder`/`Decoder` pairs; `PeerSession` swaps from the former to the
//! latter immediately after the handshake, reusing the underlying
//! `Framed`'s read/write buffers (see `peer::session::PeerSession::start`).

use std::convert::TryFrom;
use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::bitfield::Bitfield;
use crate::error::{Error, ProtocolError};
use crate::{BlockInfo, PeerId, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Bit `0x10` of the 6th (index 5) reserved byte, conventionally referred to
/// as "bit 20" when the 8 reserved bytes are read as one 64 bit field,
/// advertises support for the extension protocol (LTEP, message id 20;
/// spec.md §4.5).
const LTEP_RESERVED_BIT: u8 = 0x10;

/// The 68 byte message exchanged by both sides before any other message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, supports_ltep: bool) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        if supports_ltep {
            reserved[5] |= LTEP_RESERVED_BIT;
        }
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_ltep(&self) -> bool {
        self.reserved[5] & LTEP_RESERVED_BIT != 0
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Error> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek the protocol string length without consuming, since we don't
        // yet know whether the full handshake has arrived
        let mut peek = Cursor::new(&buf[..]);
        let prot_len = peek.get_u8() as usize;
        if prot_len != PROTOCOL_STRING.as_bytes().len() {
            return Err(Error::Protocol(ProtocolError::BadHandshake));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The numeric message ids defined by the protocol (spec.md §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            20 => Ok(Self::Extended),
            _ => Err(Error::Protocol(ProtocolError::BadPayload)),
        }
    }
}

/// A decoded peer protocol message (spec.md §4.5's message table).
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    Port { port: u16 },
    /// The LTEP envelope (message id 20): `ext_id` 0 is reserved for the
    /// extended handshake itself, any other value is a negotiated
    /// sub-message (e.g. ut_pex) keyed by the dictionary the handshake
    /// announced (spec.md §4.5's extension paragraph).
    Extended { ext_id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::KeepAlive => MessageId::Choke, // keepalive has no id on the wire
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Block { .. } => MessageId::Block,
            Self::Cancel(_) => MessageId::Cancel,
            Self::Port { .. } => MessageId::Port,
            Self::Extended { .. } => MessageId::Extended,
        }
    }
}

/// Protocol-level read state (spec.md §4.5's "Read state machine"). Block
/// payloads are drained incrementally into an accumulator as they arrive
/// rather than waiting for the whole (up to 16 KiB) message to be
/// buffered, since they dominate wire traffic.
enum DecodeState {
    AwaitingLength,
    AwaitingMessage { msg_len: u32 },
    ReadingPiece { piece_index: usize, offset: u32, data: Vec<u8>, remaining: u32 },
}

pub(crate) struct PeerCodec {
    state: DecodeState,
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self {
            state: DecodeState::AwaitingLength,
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let payload = bitfield.byte_view();
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(payload);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Extended { ext_id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            match &mut self.state {
                DecodeState::AwaitingLength => {
                    if buf.remaining() < 4 {
                        return Ok(None);
                    }
                    let msg_len = Cursor::new(&buf[..]).get_u32();
                    if msg_len == 0 {
                        buf.advance(4);
                        return Ok(Some(Message::KeepAlive));
                    }
                    self.state = DecodeState::AwaitingMessage { msg_len };
                }
                DecodeState::AwaitingMessage { msg_len } => {
                    let msg_len = *msg_len;
                    if buf.remaining() < 5 {
                        return Ok(None);
                    }
                    let id = buf[4];
                    // once the 8 byte PIECE header is available, switch to
                    // streaming the block payload rather than waiting for
                    // the whole (up to 16 KiB) message
                    if id == MessageId::Block as u8 {
                        if buf.remaining() < 4 + 1 + 8 {
                            return Ok(None);
                        }
                        if msg_len < 9 {
                            return Err(Error::Protocol(ProtocolError::BadLength));
                        }
                        buf.advance(5);
                        let piece_index = buf.get_u32() as usize;
                        let offset = buf.get_u32();
                        self.state = DecodeState::ReadingPiece {
                            piece_index,
                            offset,
                            data: Vec::with_capacity((msg_len - 9) as usize),
                            remaining: msg_len - 9,
                        };
                        continue;
                    }

                    if buf.remaining() < 4 + msg_len as usize {
                        return Ok(None);
                    }
                    buf.advance(4);
                    let id = buf.get_u8();
                    let msg = parse_message(MessageId::try_from(id)?, msg_len, buf)?;
                    self.state = DecodeState::AwaitingLength;
                    return Ok(Some(msg));
                }
                DecodeState::ReadingPiece {
                    data, remaining, ..
                } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = (*remaining as usize).min(buf.remaining());
                    data.extend_from_slice(&buf[..n]);
                    buf.advance(n);
                    *remaining -= n as u32;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    let (piece_index, offset, data) = match std::mem::replace(
                        &mut self.state,
                        DecodeState::AwaitingLength,
                    ) {
                        DecodeState::ReadingPiece { piece_index, offset, data, .. } => {
                            (piece_index, offset, data)
                        }
                        _ => unreachable!(),
                    };
                    return Ok(Some(Message::Block { piece_index, offset, data }));
                }
            }
        }
    }
}

/// Parses a message body of a known `msg_len` (including the 1 byte id)
/// whose bytes are already fully buffered, for every message type besides
/// `Block` (handled separately by the `ReadingPiece` streaming state).
fn parse_message(id: MessageId, msg_len: u32, buf: &mut BytesMut) -> Result<Message, Error> {
    match id {
        MessageId::Choke => Ok(Message::Choke),
        MessageId::Unchoke => Ok(Message::Unchoke),
        MessageId::Interested => Ok(Message::Interested),
        MessageId::NotInterested => Ok(Message::NotInterested),
        MessageId::Have => {
            if msg_len != 5 {
                return Err(Error::Protocol(ProtocolError::BadLength));
            }
            Ok(Message::Have {
                piece_index: buf.get_u32() as usize,
            })
        }
        MessageId::Bitfield => {
            let payload_len = msg_len as usize - 1;
            let mut bytes = vec![0; payload_len];
            buf.copy_to_slice(&mut bytes);
            // the wire message carries no piece count, so every bit of the
            // trailing byte is taken as significant for now; the session
            // re-validates and resizes this against the torrent's actual
            // piece count once it knows it (spec.md §4.5's BITFIELD
            // handling)
            let bit_len = bytes.len() * 8;
            let bitfield = Bitfield::from_wire_bytes(&bytes, bit_len)
                .expect("bit_len == bytes.len() * 8 never has spare bits");
            Ok(Message::Bitfield(bitfield))
        }
        MessageId::Request => {
            if msg_len != 13 {
                return Err(Error::Protocol(ProtocolError::BadLength));
            }
            Ok(Message::Request(BlockInfo {
                piece_index: buf.get_u32() as usize,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }))
        }
        MessageId::Cancel => {
            if msg_len != 13 {
                return Err(Error::Protocol(ProtocolError::BadLength));
            }
            Ok(Message::Cancel(BlockInfo {
                piece_index: buf.get_u32() as usize,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }))
        }
        MessageId::Port => {
            if msg_len != 3 {
                return Err(Error::Protocol(ProtocolError::BadLength));
            }
            Ok(Message::Port { port: buf.get_u16() })
        }
        MessageId::Extended => {
            if msg_len < 2 {
                return Err(Error::Protocol(ProtocolError::BadLength));
            }
            let ext_id = buf.get_u8();
            let payload_len = msg_len as usize - 2;
            let mut payload = vec![0; payload_len];
            buf.copy_to_slice(&mut payload);
            Ok(Message::Extended { ext_id, payload })
        }
        MessageId::Block => unreachable!("Block is handled by the ReadingPiece state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_handshake() -> (Handshake, Bytes) {
        let handshake = Handshake::new([3u8; 20], [4u8; 20], true);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        (handshake, buf.freeze())
    }

    #[test]
    fn test_handshake_round_trip() {
        let (handshake, encoded) = make_handshake();
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.supports_ltep());
    }

    #[test]
    fn test_handshake_needs_full_buffer() {
        let (_, encoded) = make_handshake();
        let mut partial = BytesMut::from(&encoded[0..30]);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_handshake_bad_protocol_string_is_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.extend_from_slice(b"nope");
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    fn round_trip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec::default().encode(msg, &mut buf).unwrap();
        PeerCodec::default().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_simple_messages_round_trip() {
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(round_trip(Message::NotInterested), Message::NotInterested);
        assert_eq!(
            round_trip(Message::Have { piece_index: 7 }),
            Message::Have { piece_index: 7 }
        );
        assert_eq!(
            round_trip(Message::Port { port: 6881 }),
            Message::Port { port: 6881 }
        );
    }

    #[test]
    fn test_request_and_cancel_round_trip() {
        let block = BlockInfo {
            piece_index: 2,
            offset: 0x4000,
            len: crate::BLOCK_LEN,
        };
        assert_eq!(round_trip(Message::Request(block)), Message::Request(block));
        assert_eq!(round_trip(Message::Cancel(block)), Message::Cancel(block));
    }

    #[test]
    fn test_block_round_trip_and_chunked_decode() {
        let data = vec![7u8; crate::BLOCK_LEN as usize];
        let msg = Message::Block {
            piece_index: 1,
            offset: 0,
            data: data.clone(),
        };
        let mut encoded = BytesMut::new();
        PeerCodec::default().encode(msg, &mut encoded).unwrap();

        let mut codec = PeerCodec::default();
        let split = encoded.len() / 2;
        let mut partial = encoded.split_to(split);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        let mut buf = partial;
        buf.unsplit(encoded);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            Message::Block {
                piece_index: 1,
                offset: 0,
                data
            }
        );
    }

    #[test]
    fn test_bitfield_round_trip() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(9);
        let msg = round_trip(Message::Bitfield(bf.clone()));
        match msg {
            Message::Bitfield(decoded) => {
                // the wire representation has no piece count, so the decoded
                // bitfield's length is rounded up to a byte boundary
                assert!(decoded.test(0));
                assert!(decoded.test(9));
            }
            _ => panic!("expected bitfield"),
        }
    }

    #[test]
    fn test_extended_message_round_trip() {
        let msg = Message::Extended {
            ext_id: 0,
            payload: b"d1:md6:ut_pexi1eee".to_vec(),
        };
        assert_eq!(
            round_trip(msg),
            Message::Extended {
                ext_id: 0,
                payload: b"d1:md6:ut_pexi1eee".to_vec(),
            }
        );
    }
}
