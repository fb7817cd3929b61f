use thiserror::Error;

/// Errors that can occur on a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a malformed handshake record.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The dialed peer identified as someone else.
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: u32, actual: u32 },

    /// A handshake named a peer id absent from the roster.
    #[error("unknown peer id {0}")]
    UnknownPeer(u32),

    /// A second connection identified as an already-registered peer.
    #[error("peer {0} is already connected")]
    DuplicatePeer(u32),

    /// Received a malformed framed packet.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Received an unknown packet type id.
    #[error("invalid packet id: {0}")]
    InvalidPacketId(u8),

    /// A frame length exceeded the sanity cap.
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(usize),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,
}
