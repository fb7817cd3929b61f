//! swarmfile - static-roster peer-to-peer file distribution
//!
//! A swarm of statically-configured peers exchanges one file over direct
//! TCP connections using a BitTorrent-style wire protocol: a handshake,
//! bitfield reconciliation, interest declarations, a reciprocating choke
//! scheduler and piece transfer. Every peer starts with the whole file or
//! nothing; the swarm exits once everyone holds everything.
//!
//! # Modules
//!
//! - [`config`] - the `Common.cfg` / `PeerInfo.cfg` startup files
//! - [`peer`] - wire codec, per-connection state and the listener/sender/
//!   handler tasks driving one socket
//! - [`piece`] - the local piece array and request bookkeeping
//! - [`choking`] - the preferred-neighbor and optimistic-unchoke loops
//! - [`swarm`] - the local peer manager: registry, accept/dial, HAVE
//!   broadcast, termination
//! - [`storage`] - seed loading and completed-file persistence

pub mod choking;
pub mod config;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod swarm;

pub use config::{CommonConfig, ConfigError, PeerInfo, PeerRoster};
pub use peer::{Bitfield, ConnectionState, Handshake, Packet, PacketType, PeerError, PeerLink};
pub use piece::{PieceStatus, PieceStore};
pub use storage::StorageError;
pub use swarm::{Swarm, SwarmError};
