use super::error::PeerError;
use super::handler::PacketHandler;
use super::packet::{Handshake, Packet, HANDSHAKE_LEN};
use super::state::ConnectionState;
use crate::swarm::Swarm;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound packets queued per connection before the writer applies
/// backpressure to the handler and schedulers.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Sanity cap on a single frame; anything larger is a protocol violation.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Handle to one live connection: its shared state plus the outbound queue.
///
/// The swarm registry hands these out so the handler of one connection and
/// the choking scheduler can enqueue packets for any peer.
pub struct PeerLink {
    state: Arc<ConnectionState>,
    outbound: mpsc::Sender<Packet>,
}

impl PeerLink {
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Queues a packet for the writer task. Returns `false` when the
    /// connection is gone.
    pub async fn send(&self, packet: Packet) -> bool {
        self.outbound.send(packet).await.is_ok()
    }
}

/// Drives one socket to completion: spawns the writer task, performs the
/// handshake exchange, then runs the framed read loop with the handler
/// invoked inline. Cleans up registry and claimed pieces on the way out.
pub async fn run(
    stream: TcpStream,
    expected_peer: Option<u32>,
    initiated: bool,
    swarm: Arc<Swarm>,
) {
    let (rd, wr) = stream.into_split();

    let state = Arc::new(ConnectionState::new(
        expected_peer,
        swarm.store().piece_count(),
    ));
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let link = Arc::new(PeerLink {
        state: state.clone(),
        outbound: outbound_tx,
    });

    let writer = tokio::spawn(run_sender(wr, outbound_rx, state.clone()));

    if initiated {
        let _ = link
            .send(Packet::Handshake(Handshake::new(swarm.local_id())))
            .await;
    }

    let handler = PacketHandler::new(swarm.clone(), state.clone(), link.clone(), initiated);

    if let Err(e) = run_listener(rd, &state, &handler).await {
        match e {
            PeerError::ConnectionClosed | PeerError::Io(_) => {
                debug!(peer = state.remote_peer_id(), error = %e, "connection ended")
            }
            other => warn!(peer = state.remote_peer_id(), error = %other, "connection failed"),
        }
    }

    state.deactivate();

    // A piece we asked this peer for is fair game for other peers now.
    if let Some(piece) = state.take_pending_request() {
        swarm.store().release(piece);
        swarm.reannounce_interest(piece).await;
    }

    if let Some(id) = state.remote_peer_id() {
        swarm.deregister(id, &link);
        info!(peer = id, "connection closed");
    }

    let _ = writer.await;
}

/// The read side: one 32-byte handshake record, then length-prefixed frames
/// until the connection goes inactive or the stream errors out.
async fn run_listener(
    mut rd: OwnedReadHalf,
    state: &ConnectionState,
    handler: &PacketHandler,
) -> Result<(), PeerError> {
    let mut hs_buf = [0u8; HANDSHAKE_LEN];
    read_or_close(&mut rd, state, &mut hs_buf).await?;
    handler.on_handshake(Handshake::decode(&hs_buf)?).await?;

    while state.is_active() {
        let mut len_buf = [0u8; 4];
        read_or_close(&mut rd, state, &mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len < 1 {
            debug!(peer = state.remote_peer_id(), "dropping empty frame");
            continue;
        }
        if len > MAX_FRAME_SIZE {
            return Err(PeerError::OversizedFrame(len));
        }

        let mut payload = vec![0u8; len];
        read_or_close(&mut rd, state, &mut payload).await?;

        let packet = match Packet::decode(Bytes::from(payload)) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = state.remote_peer_id(), error = %e, "dropping malformed packet");
                Packet::Unknown
            }
        };

        handler.handle(packet).await?;
    }

    Ok(())
}

/// `read_exact` that also wakes up when the connection is deactivated, so
/// shutdown is observed between frames.
async fn read_or_close(
    rd: &mut OwnedReadHalf,
    state: &ConnectionState,
    buf: &mut [u8],
) -> Result<(), PeerError> {
    tokio::select! {
        result = rd.read_exact(buf) => {
            result?;
            Ok(())
        }
        _ = state.closed() => Err(PeerError::ConnectionClosed),
    }
}

/// The write side: drains the outbound queue, writing each packet as one
/// uninterrupted frame. On shutdown the already-queued packets are flushed
/// before the socket is closed.
async fn run_sender(
    mut wr: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Packet>,
    state: Arc<ConnectionState>,
) {
    loop {
        let packet = tokio::select! {
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = state.closed() => break,
        };

        if !write_packet(&mut wr, &packet, &state).await {
            return;
        }
    }

    while let Ok(packet) = outbound.try_recv() {
        if !write_packet(&mut wr, &packet, &state).await {
            return;
        }
    }

    let _ = wr.shutdown().await;
}

async fn write_packet(wr: &mut OwnedWriteHalf, packet: &Packet, state: &ConnectionState) -> bool {
    let bytes = packet.encode();
    if bytes.is_empty() {
        return true;
    }

    if let Err(e) = wr.write_all(&bytes).await {
        warn!(peer = state.remote_peer_id(), error = %e, "write failed");
        state.deactivate();
        return false;
    }

    true
}
