use super::bitfield::Bitfield;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// State shared by one connection's listener, sender, handler and the
/// choking scheduler.
///
/// Flags live behind a single mutex; the download counter and the two
/// one-way latches (handshake done, connection active) are atomics so the
/// scheduler can read them without contending with the handler.
pub struct ConnectionState {
    remote_peer_id: Mutex<Option<u32>>,
    remote_pieces: Mutex<Bitfield>,
    flags: Mutex<Flags>,
    downloaded_bytes: AtomicU64,
    active: AtomicBool,
    handshaken: AtomicBool,
    shutdown: Notify,
}

struct Flags {
    /// We refuse the remote's REQUESTs. Written only by the scheduler.
    local_choke: bool,
    /// The remote refuses our REQUESTs.
    remote_choke: bool,
    /// The remote declared interest in our pieces.
    interested: bool,
    /// Our BITFIELD went out; HAVE may follow.
    sent_bitfield: bool,
    /// The single piece index we have a REQUEST in flight for.
    pending_request: Option<u32>,
}

impl ConnectionState {
    /// Fresh state for a socket. `expected_peer` is the dialed peer's id,
    /// or `None` for accepted sockets where the remote identifies itself
    /// in its handshake.
    pub fn new(expected_peer: Option<u32>, piece_count: usize) -> Self {
        Self {
            remote_peer_id: Mutex::new(expected_peer),
            remote_pieces: Mutex::new(Bitfield::new(piece_count)),
            flags: Mutex::new(Flags {
                local_choke: true,
                remote_choke: true,
                interested: false,
                sent_bitfield: false,
                pending_request: None,
            }),
            downloaded_bytes: AtomicU64::new(0),
            active: AtomicBool::new(true),
            handshaken: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn remote_peer_id(&self) -> Option<u32> {
        *self.remote_peer_id.lock()
    }

    pub fn set_remote_peer_id(&self, id: u32) {
        *self.remote_peer_id.lock() = Some(id);
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ends the connection: listener and sender observe this between
    /// frames / queue takes and exit.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// Resolves when [`deactivate`](Self::deactivate) is called.
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a notification between the
        // check and the await cannot be missed.
        notified.as_mut().enable();
        if !self.is_active() {
            return;
        }
        notified.await;
    }

    pub fn mark_handshaken(&self) {
        self.handshaken.store(true, Ordering::Release);
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken.load(Ordering::Acquire)
    }

    // ---- remote view -----------------------------------------------------

    pub fn set_remote_pieces(&self, view: Bitfield) {
        *self.remote_pieces.lock() = view;
    }

    pub fn record_remote_have(&self, piece: u32) {
        self.remote_pieces.lock().set(piece as usize);
    }

    pub fn remote_pieces(&self) -> Bitfield {
        self.remote_pieces.lock().clone()
    }

    pub fn remote_complete(&self) -> bool {
        self.remote_pieces.lock().is_complete()
    }

    // ---- choke / interest flags ------------------------------------------

    pub fn is_local_choked(&self) -> bool {
        self.flags.lock().local_choke
    }

    pub fn set_local_choke(&self, choked: bool) {
        self.flags.lock().local_choke = choked;
    }

    pub fn is_remote_choked(&self) -> bool {
        self.flags.lock().remote_choke
    }

    pub fn set_remote_choke(&self, choked: bool) {
        self.flags.lock().remote_choke = choked;
    }

    pub fn is_interested(&self) -> bool {
        self.flags.lock().interested
    }

    pub fn set_interested(&self, interested: bool) {
        self.flags.lock().interested = interested;
    }

    pub fn has_sent_bitfield(&self) -> bool {
        self.flags.lock().sent_bitfield
    }

    pub fn mark_bitfield_sent(&self) {
        self.flags.lock().sent_bitfield = true;
    }

    // ---- in-flight request marker ----------------------------------------

    pub fn pending_request(&self) -> Option<u32> {
        self.flags.lock().pending_request
    }

    pub fn set_pending_request(&self, piece: u32) {
        self.flags.lock().pending_request = Some(piece);
    }

    pub fn take_pending_request(&self) -> Option<u32> {
        self.flags.lock().pending_request.take()
    }

    /// Clears the marker only if it names `piece`.
    pub fn clear_pending_request(&self, piece: u32) {
        let mut flags = self.flags.lock();
        if flags.pending_request == Some(piece) {
            flags.pending_request = None;
        }
    }

    // ---- download accounting ---------------------------------------------

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_downloaded(&self) {
        self.downloaded_bytes.store(0, Ordering::Relaxed);
    }
}
