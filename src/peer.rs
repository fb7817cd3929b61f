//! Per-connection protocol machinery.
//!
//! Each TCP connection gets a listener task reading framed packets, a
//! sender task draining an outbound queue, and a handler invoked inline by
//! the listener. All three share one [`ConnectionState`].

mod bitfield;
mod connection;
mod error;
mod handler;
mod packet;
mod state;

pub use bitfield::Bitfield;
pub use connection::PeerLink;
pub use error::PeerError;
pub use packet::{Handshake, Packet, PacketType, HANDSHAKE_HEADER, HANDSHAKE_LEN};
pub use state::ConnectionState;

pub(crate) use connection::run as run_connection;

#[cfg(test)]
mod tests;
