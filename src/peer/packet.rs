use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic string opening every handshake record.
pub const HANDSHAKE_HEADER: &[u8] = b"P2PFILESHARINGPROJ";
/// Length of the handshake record in bytes.
pub const HANDSHAKE_LEN: usize = 32;

const HANDSHAKE_PAD: usize = 10;

/// Packet type identifiers on the wire.
///
/// Every packet except the handshake carries a one-byte ID following the
/// length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Stop serving REQUESTs from the peer.
    Choke = 0,
    /// Ready to serve REQUESTs from the peer.
    Unchoke = 1,
    /// Want pieces from the peer.
    Interested = 2,
    /// Don't want pieces from the peer.
    NotInterested = 3,
    /// Announce a newly-acquired piece.
    Have = 4,
    /// Announce all held pieces at once.
    Bitfield = 5,
    /// Ask for a piece.
    Request = 6,
    /// Deliver piece content.
    Piece = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Choke),
            1 => Ok(PacketType::Unchoke),
            2 => Ok(PacketType::Interested),
            3 => Ok(PacketType::NotInterested),
            4 => Ok(PacketType::Have),
            5 => Ok(PacketType::Bitfield),
            6 => Ok(PacketType::Request),
            7 => Ok(PacketType::Piece),
            _ => Err(PeerError::InvalidPacketId(value)),
        }
    }
}

/// The fixed 32-byte handshake record.
///
/// Layout: the 18-byte header literal, 10 zero bytes, then the sender's
/// peer id as a 4-byte big-endian integer. The handshake is the only
/// unframed record on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// The sender's peer id.
    pub peer_id: u32,
}

impl Handshake {
    pub fn new(peer_id: u32) -> Self {
        Self { peer_id }
    }

    /// Encodes the handshake to its 32-byte wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_slice(HANDSHAKE_HEADER);
        buf.put_bytes(0, HANDSHAKE_PAD);
        buf.put_u32(self.peer_id);
        buf.freeze()
    }

    /// Decodes a 32-byte handshake record, validating the header literal.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if &data[..HANDSHAKE_HEADER.len()] != HANDSHAKE_HEADER {
            return Err(PeerError::InvalidHandshake);
        }

        let start = HANDSHAKE_HEADER.len() + HANDSHAKE_PAD;
        let peer_id = u32::from_be_bytes([
            data[start],
            data[start + 1],
            data[start + 2],
            data[start + 3],
        ]);

        Ok(Self { peer_id })
    }
}

/// A swarm wire packet.
///
/// Framed packets are length-prefixed: a 4-byte big-endian length counting
/// the 1-byte type ID plus payload, then the type ID and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// The unframed 32-byte opening record.
    Handshake(Handshake),
    /// We refuse REQUESTs from the peer.
    Choke,
    /// We accept REQUESTs from the peer.
    Unchoke,
    /// The peer holds pieces we lack.
    Interested,
    /// The peer holds nothing we lack.
    NotInterested,
    /// We acquired a piece.
    Have { piece: u32 },
    /// Every piece we hold, as a bitset.
    Bitfield(Bytes),
    /// Ask the peer for a piece.
    Request { piece: u32 },
    /// Piece content.
    Piece { piece: u32, data: Bytes },
    /// Anything that failed to parse; dropped by the handler.
    Unknown,
}

impl Packet {
    /// Encodes the packet to its framed wire form.
    ///
    /// The handshake encodes to its raw 32-byte record instead. `Unknown`
    /// has no wire form and is never enqueued for sending.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Packet::Handshake(hs) => return hs.encode(),
            Packet::Choke => {
                buf.put_u32(1);
                buf.put_u8(PacketType::Choke as u8);
            }
            Packet::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(PacketType::Unchoke as u8);
            }
            Packet::Interested => {
                buf.put_u32(1);
                buf.put_u8(PacketType::Interested as u8);
            }
            Packet::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(PacketType::NotInterested as u8);
            }
            Packet::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(PacketType::Have as u8);
                buf.put_u32(*piece);
            }
            Packet::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(PacketType::Bitfield as u8);
                buf.put_slice(bits);
            }
            Packet::Request { piece } => {
                buf.put_u32(5);
                buf.put_u8(PacketType::Request as u8);
                buf.put_u32(*piece);
            }
            Packet::Piece { piece, data } => {
                buf.put_u32(5 + data.len() as u32);
                buf.put_u8(PacketType::Piece as u8);
                buf.put_u32(*piece);
                buf.put_slice(data);
            }
            Packet::Unknown => {}
        }

        buf.freeze()
    }

    /// Decodes a framed payload (type byte plus body, length prefix already
    /// consumed by the listener).
    pub fn decode(mut payload: Bytes) -> Result<Self, PeerError> {
        if payload.is_empty() {
            return Err(PeerError::InvalidPacket("empty payload".into()));
        }

        let kind = PacketType::try_from(payload.get_u8())?;

        match kind {
            PacketType::Choke => Ok(Packet::Choke),
            PacketType::Unchoke => Ok(Packet::Unchoke),
            PacketType::Interested => Ok(Packet::Interested),
            PacketType::NotInterested => Ok(Packet::NotInterested),
            PacketType::Have => {
                if payload.remaining() < 4 {
                    return Err(PeerError::InvalidPacket("have too short".into()));
                }
                Ok(Packet::Have {
                    piece: payload.get_u32(),
                })
            }
            PacketType::Bitfield => Ok(Packet::Bitfield(payload)),
            PacketType::Request => {
                if payload.remaining() < 4 {
                    return Err(PeerError::InvalidPacket("request too short".into()));
                }
                Ok(Packet::Request {
                    piece: payload.get_u32(),
                })
            }
            PacketType::Piece => {
                if payload.remaining() < 4 {
                    return Err(PeerError::InvalidPacket("piece too short".into()));
                }
                let piece = payload.get_u32();
                Ok(Packet::Piece {
                    piece,
                    data: payload,
                })
            }
        }
    }
}
