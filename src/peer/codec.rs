use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield_byte_len, error::*, storage_info::StorageInfo, Bitfield, PeerId, PieceIndex,
};

/// The 18 byte header every handshake frame starts with.
pub(crate) const PROTOCOL_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";

/// The reserved bytes between the header and the peer id. Zero on encode,
/// ignored on decode.
const RESERVED_LEN: usize = 10;

/// A handshake frame is exactly 32 bytes: header, reserved bytes, peer id.
pub(crate) const HANDSHAKE_LEN: usize = PROTOCOL_HEADER.len() + RESERVED_LEN + 4;

/// The handshake exchanged once at connection start. Only the sender's id
/// varies; the header is fixed and the reserved bytes carry no meaning yet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }
}

/// Codec for the handshake frame.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        buf.reserve(HANDSHAKE_LEN);
        buf.extend_from_slice(PROTOCOL_HEADER);
        buf.extend_from_slice(&[0; RESERVED_LEN]);
        buf.put_u32(handshake.peer_id);
        debug_assert_eq!(buf.len() - start, HANDSHAKE_LEN);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        if &buf[..PROTOCOL_HEADER.len()] != PROTOCOL_HEADER {
            return Err(Error::BadHandshakeHeader);
        }
        buf.advance(PROTOCOL_HEADER.len());
        // the reserved bytes are not validated
        buf.advance(RESERVED_LEN);
        let peer_id = buf.get_u32();

        Ok(Some(Handshake::new(peer_id)))
    }
}

/// The type ids of the regular, length-prefixed frames.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// All regular messages exchanged after the handshake.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(PieceIndex),
    Piece { index: PieceIndex, data: Vec<u8> },
}

impl Message {
    pub fn id(&self) -> MessageId {
        use Message::*;
        match self {
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have(_) => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request(_) => MessageId::Request,
            Piece { .. } => MessageId::Piece,
        }
    }
}

/// Codec for all regular frames.
///
/// Every frame is a 4-byte big endian length (of the type byte plus payload),
/// the type byte, and the payload. Decoding validates the payload against the
/// file's piece geometry: piece indices must be in bounds, a bitfield must be
/// exactly as long as the serialized own bitfield, and a piece's content must
/// be exactly as long as the piece it claims to be.
pub(crate) struct PeerCodec {
    info: StorageInfo,
    /// The largest frame length the geometry allows; anything longer is
    /// rejected before it can grow the read buffer.
    max_frame_len: usize,
}

impl PeerCodec {
    pub fn new(info: StorageInfo) -> Self {
        let max_payload = (4 + info.piece_len as usize).max(bitfield_byte_len(info.piece_count));
        Self {
            info,
            max_frame_len: 1 + max_payload,
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            Choke | Unchoke | Interested | NotInterested => {
                let id = msg.id();
                buf.put_u32(1);
                buf.put_u8(id as u8);
            }
            Have(index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index as u32);
            }
            Bitfield(bitfield) => {
                debug_assert_eq!(bitfield.len(), self.info.piece_count);
                let bytes = pack_bitfield(&bitfield);
                buf.put_u32((1 + bytes.len()) as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Request(index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(index as u32);
            }
            Piece { index, data } => {
                buf.put_u32((1 + 4 + data.len()) as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index as u32);
                buf.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        // the type byte is part of the length, so zero is never valid, and
        // no valid frame exceeds the geometry derived maximum
        if msg_len == 0 || msg_len > self.max_frame_len {
            return Err(Error::MalformedPayload("frame length"));
        }
        if buf.len() < 4 + msg_len {
            return Ok(None);
        }
        buf.advance(4);

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len - 1;

        let msg = match id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested
            | MessageId::NotInterested => {
                if payload_len != 0 {
                    return Err(Error::MalformedPayload("control"));
                }
                match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MessageId::Have | MessageId::Request => {
                if payload_len != 4 {
                    return Err(Error::MalformedPayload("piece index"));
                }
                let index = buf.get_u32() as PieceIndex;
                if index >= self.info.piece_count {
                    return Err(Error::InvalidPieceIndex(index));
                }
                if id == MessageId::Have {
                    Message::Have(index)
                } else {
                    Message::Request(index)
                }
            }
            MessageId::Bitfield => {
                if payload_len != bitfield_byte_len(self.info.piece_count) {
                    return Err(Error::MalformedPayload("bitfield"));
                }
                let mut raw = vec![0; payload_len];
                buf.copy_to_slice(&mut raw);
                Message::Bitfield(unpack_bitfield(&raw, self.info.piece_count))
            }
            MessageId::Piece => {
                if payload_len < 4 {
                    return Err(Error::MalformedPayload("piece"));
                }
                let index = buf.get_u32() as PieceIndex;
                let expected_len = self.info.piece_len(index)? as usize;
                if payload_len - 4 != expected_len {
                    return Err(Error::MalformedPayload("piece"));
                }
                let mut data = vec![0; expected_len];
                buf.copy_to_slice(&mut data);
                Message::Piece { index, data }
            }
        };

        Ok(Some(msg))
    }
}

/// Serializes a bitfield into its wire form: one bit per piece, most
/// significant bit first, with the unused low bits of the last byte zero.
pub(crate) fn pack_bitfield(bitfield: &Bitfield) -> Vec<u8> {
    let mut bytes = vec![0; bitfield_byte_len(bitfield.len())];
    for (index, bit) in bitfield.iter().enumerate() {
        if *bit {
            bytes[index / 8] |= 1 << (7 - index % 8);
        }
    }
    bytes
}

/// Reads a wire bitfield back into a `Bitfield` of exactly `piece_count`
/// bits. Bits beyond the piece count are ignored, so a sloppy remote's spare
/// bits can never name pieces outside the file.
pub(crate) fn unpack_bitfield(bytes: &[u8], piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::repeat(false, piece_count);
    for index in 0..piece_count.min(bytes.len() * 8) {
        if bytes[index / 8] & (1 << (7 - index % 8)) != 0 {
            bitfield.set(index, true);
        }
    }
    bitfield
}
