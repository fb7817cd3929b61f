use super::bitfield::Bitfield;
use super::connection::PeerLink;
use super::error::PeerError;
use super::packet::{Handshake, Packet};
use super::state::ConnectionState;
use crate::swarm::Swarm;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reacts to each inbound packet: mutates connection state, talks to the
/// swarm, and queues replies.
///
/// Driven inline by the listener, so handling within one connection is
/// strictly sequential.
pub struct PacketHandler {
    swarm: Arc<Swarm>,
    state: Arc<ConnectionState>,
    link: Arc<PeerLink>,
    initiated: bool,
}

impl PacketHandler {
    pub fn new(
        swarm: Arc<Swarm>,
        state: Arc<ConnectionState>,
        link: Arc<PeerLink>,
        initiated: bool,
    ) -> Self {
        Self {
            swarm,
            state,
            link,
            initiated,
        }
    }

    /// Validates the opening record and brings the connection up: reply
    /// handshake when we are the accepting side, our BITFIELD when we hold
    /// anything, registration, and the handshake latch.
    pub async fn on_handshake(&self, handshake: Handshake) -> Result<(), PeerError> {
        let remote = handshake.peer_id;

        match self.state.remote_peer_id() {
            Some(expected) if expected != remote => {
                return Err(PeerError::PeerIdMismatch {
                    expected,
                    actual: remote,
                });
            }
            Some(_) => {}
            None => self.state.set_remote_peer_id(remote),
        }

        self.swarm.register(remote, self.link.clone())?;

        if !self.initiated {
            self.send(Packet::Handshake(Handshake::new(self.swarm.local_id())))
                .await?;
        }

        let snapshot = self.swarm.store().bitfield();
        if snapshot.count_ones() > 0 {
            self.send(Packet::Bitfield(snapshot.to_bytes())).await?;
        }
        // Latched even with nothing to announce, so HAVE may flow later.
        self.state.mark_bitfield_sent();
        self.state.mark_handshaken();

        // A piece landing between the snapshot and the latch missed both
        // the BITFIELD and the broadcast; announce it individually.
        let current = self.swarm.store().bitfield();
        for piece in 0..current.piece_count() {
            if current.has(piece) && !snapshot.has(piece) {
                self.send(Packet::Have {
                    piece: piece as u32,
                })
                .await?;
            }
        }

        info!(peer = remote, "handshake complete");
        Ok(())
    }

    pub async fn handle(&self, packet: Packet) -> Result<(), PeerError> {
        match packet {
            Packet::Choke => self.on_choke().await,
            Packet::Unchoke => self.on_unchoke().await?,
            Packet::Interested => {
                debug!(peer = self.state.remote_peer_id(), "peer is interested");
                self.state.set_interested(true);
            }
            Packet::NotInterested => {
                debug!(peer = self.state.remote_peer_id(), "peer is not interested");
                self.state.set_interested(false);
            }
            Packet::Bitfield(bits) => self.on_bitfield(&bits).await?,
            Packet::Have { piece } => self.on_have(piece).await?,
            Packet::Request { piece } => self.on_request(piece).await?,
            Packet::Piece { piece, data } => self.on_piece(piece, data).await?,
            Packet::Handshake(_) => {
                debug!(
                    peer = self.state.remote_peer_id(),
                    "dropping repeated handshake"
                );
            }
            Packet::Unknown => {
                debug!(peer = self.state.remote_peer_id(), "dropping unknown packet");
            }
        }
        Ok(())
    }

    /// The remote refuses further REQUESTs. Whatever we had in flight is
    /// released so another peer can be asked for it.
    async fn on_choke(&self) {
        debug!(peer = self.state.remote_peer_id(), "choked by peer");
        self.state.set_remote_choke(true);

        if let Some(piece) = self.state.take_pending_request() {
            self.swarm.store().release(piece);
            self.swarm.reannounce_interest(piece).await;
        }
    }

    async fn on_unchoke(&self) -> Result<(), PeerError> {
        debug!(peer = self.state.remote_peer_id(), "unchoked by peer");
        self.state.set_remote_choke(false);
        self.request_next().await
    }

    async fn on_bitfield(&self, bits: &Bytes) -> Result<(), PeerError> {
        let view = Bitfield::from_bytes(bits, self.swarm.store().piece_count());
        let complete = view.is_complete();
        debug!(
            peer = self.state.remote_peer_id(),
            pieces = view.count_ones(),
            "bitfield received"
        );
        self.state.set_remote_pieces(view);

        self.send_interest().await?;
        self.note_remote_progress(complete);
        self.swarm.attempt_terminate();
        Ok(())
    }

    async fn on_have(&self, piece: u32) -> Result<(), PeerError> {
        debug!(peer = self.state.remote_peer_id(), piece, "have received");
        self.state.record_remote_have(piece);

        self.send_interest().await?;
        self.note_remote_progress(self.state.remote_complete());
        self.swarm.attempt_terminate();
        Ok(())
    }

    /// Served only while the remote is unchoked by us; choked requests are
    /// dropped silently per protocol.
    async fn on_request(&self, piece: u32) -> Result<(), PeerError> {
        debug!(peer = self.state.remote_peer_id(), piece, "request received");
        if self.state.is_local_choked() {
            return Ok(());
        }

        match self.swarm.store().content(piece as usize) {
            Some(data) => self.send(Packet::Piece { piece, data }).await,
            None => {
                warn!(
                    peer = self.state.remote_peer_id(),
                    piece, "cannot serve a piece we do not hold"
                );
                Ok(())
            }
        }
    }

    async fn on_piece(&self, piece: u32, data: Bytes) -> Result<(), PeerError> {
        let bytes = data.len() as u64;
        debug!(peer = self.state.remote_peer_id(), piece, bytes, "piece received");

        self.state.clear_pending_request(piece);
        self.swarm.deliver_piece(piece, data).await;
        self.state.add_downloaded(bytes);

        self.request_next().await?;
        self.swarm.attempt_terminate();
        Ok(())
    }

    /// Claims the next wanted piece and asks for it, unless choked or a
    /// request is already in flight on this connection.
    async fn request_next(&self) -> Result<(), PeerError> {
        if self.state.is_remote_choked() || self.state.pending_request().is_some() {
            return Ok(());
        }

        let view = self.state.remote_pieces();
        if let Some(piece) = self.swarm.store().claim(&view) {
            self.state.set_pending_request(piece);
            self.send(Packet::Request { piece }).await?;
        }
        Ok(())
    }

    /// Tells the remote whether it currently holds anything we lack.
    async fn send_interest(&self) -> Result<(), PeerError> {
        let view = self.state.remote_pieces();
        if self.swarm.store().interested_in(&view) {
            self.send(Packet::Interested).await
        } else {
            self.send(Packet::NotInterested).await
        }
    }

    fn note_remote_progress(&self, complete: bool) {
        if complete {
            if let Some(id) = self.state.remote_peer_id() {
                self.swarm.note_remote_complete(id);
            }
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), PeerError> {
        if self.link.send(packet).await {
            Ok(())
        } else {
            Err(PeerError::ConnectionClosed)
        }
    }
}
