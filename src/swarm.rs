//! The local peer manager.
//!
//! [`Swarm`] owns the configuration, the roster, the local piece store and
//! the registry of live connections. It accepts sockets from later-listed
//! peers, dials earlier-listed ones, broadcasts HAVE on every piece arrival
//! and decides when the whole swarm is done.

use crate::choking;
use crate::config::{CommonConfig, ConfigError, PeerInfo, PeerRoster};
use crate::peer::{self, Packet, PeerError, PeerLink};
use crate::piece::PieceStore;
use crate::storage::{self, StorageError};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Peers start in roster order, so a dial target may not be listening yet.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const DIAL_ATTEMPTS: u32 = 60;

/// Grace for the per-connection writers to flush their queues at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

/// Fatal initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Swarm {
    local_id: u32,
    config: CommonConfig,
    roster: PeerRoster,
    base_dir: PathBuf,
    store: PieceStore,
    links: DashMap<u32, Arc<PeerLink>>,
    /// Roster peers whose view we have seen complete, kept past their
    /// connection's lifetime so a peer that exits first cannot wedge us.
    remote_complete: Mutex<HashSet<u32>>,
    /// Current preferred-neighbor set; written by the choking scheduler.
    preferred: Mutex<HashSet<u32>>,
    /// Current optimistic-unchoke slot; written by the choking scheduler.
    optimistic: Mutex<Option<u32>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Swarm {
    /// Builds the swarm state, loading the seed copy of the file when the
    /// roster says this peer starts with it.
    pub async fn new(
        local_id: u32,
        config: CommonConfig,
        roster: PeerRoster,
        base_dir: PathBuf,
    ) -> Result<Arc<Self>, SwarmError> {
        let local = roster.local(local_id)?.clone();

        let store = if local.has_file {
            let file =
                storage::load_seed(&base_dir, local_id, &config.file_name, config.file_size)
                    .await?;
            PieceStore::seeded(file, config.piece_size, config.file_size)
        } else {
            PieceStore::empty(config.piece_size, config.file_size)
        };

        info!(
            peer = local_id,
            file = %config.file_name,
            file_size = config.file_size,
            piece_size = config.piece_size,
            pieces = config.piece_count(),
            preferred_neighbors = config.preferred_neighbors,
            unchoking_interval_secs = config.unchoking_interval.as_secs(),
            optimistic_interval_secs = config.optimistic_unchoking_interval.as_secs(),
            seeded = local.has_file,
            "starting"
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            local_id,
            config,
            roster,
            base_dir,
            store,
            links: DashMap::new(),
            remote_complete: Mutex::new(HashSet::new()),
            preferred: Mutex::new(HashSet::new()),
            optimistic: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }))
    }

    /// Brings the swarm up and blocks until termination: accept loop,
    /// one dialer per earlier-listed peer, and the choking scheduler.
    pub async fn run(self: Arc<Self>) -> Result<(), SwarmError> {
        let local = self.roster.local(self.local_id)?.clone();
        let listener = TcpListener::bind(("0.0.0.0", local.port)).await?;
        info!(peer = self.local_id, port = local.port, "listening");

        tokio::spawn(accept_loop(self.clone(), listener));

        for target in self.roster.dial_targets(self.local_id) {
            tokio::spawn(dial_peer(self.clone(), target.clone()));
        }

        choking::spawn(self.clone());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        info!(peer = self.local_id, "exited swarm");
        Ok(())
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn config(&self) -> &CommonConfig {
        &self.config
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub(crate) fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ---- registry --------------------------------------------------------

    /// Registers a connection under its remote peer id. Rejects ids outside
    /// the roster and second connections for an already-linked peer.
    pub fn register(&self, id: u32, link: Arc<PeerLink>) -> Result<(), PeerError> {
        if id == self.local_id || !self.roster.contains(id) {
            return Err(PeerError::UnknownPeer(id));
        }

        match self.links.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PeerError::DuplicatePeer(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(link);
                Ok(())
            }
        }
    }

    /// Removes the registry entry, but only if it still points at `link`;
    /// a replacement connection for the same peer is left alone.
    pub fn deregister(&self, id: u32, link: &Arc<PeerLink>) {
        self.links.remove_if(&id, |_, current| Arc::ptr_eq(current, link));
    }

    pub fn link(&self, id: u32) -> Option<Arc<PeerLink>> {
        self.links.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of connections that finished their handshake and are still
    /// active. Safe against concurrent shutdown; the snapshot may contain a
    /// link that dies a moment later, whose queue sends then fail silently.
    pub fn active_links(&self) -> Vec<(u32, Arc<PeerLink>)> {
        self.links
            .iter()
            .filter(|entry| entry.value().state().is_handshaken() && entry.value().state().is_active())
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    // ---- piece flow ------------------------------------------------------

    /// Stores a piece received from the wire, announces it to every
    /// connection whose BITFIELD already went out, and persists the file the
    /// moment the store completes.
    pub async fn deliver_piece(&self, piece: u32, data: Bytes) {
        if !self.store.set_have(piece as usize, data) {
            return;
        }

        let targets: Vec<Arc<PeerLink>> = self
            .links
            .iter()
            .filter(|entry| {
                entry.value().state().has_sent_bitfield() && entry.value().state().is_active()
            })
            .map(|entry| entry.value().clone())
            .collect();

        for link in targets {
            let _ = link.send(Packet::Have { piece }).await;
        }

        if self.store.is_complete() {
            info!(peer = self.local_id, "download complete");
            self.persist_file().await;
        }
    }

    /// After a claimed piece returns to the pool, remind every peer that
    /// holds it of our interest. A NOT_INTERESTED sent while the request
    /// was in flight would otherwise stand and could stall the endgame.
    pub async fn reannounce_interest(&self, piece: u32) {
        for (_, link) in self.active_links() {
            if link.state().remote_pieces().has(piece as usize) {
                let _ = link.send(Packet::Interested).await;
            }
        }
    }

    async fn persist_file(&self) {
        let Some(file) = self.store.assemble() else {
            return;
        };

        match storage::persist(&self.base_dir, self.local_id, &self.config.file_name, &file).await
        {
            Ok(path) => info!(peer = self.local_id, path = %path.display(), "file written"),
            Err(e) => error!(peer = self.local_id, error = %e, "failed to write file"),
        }
    }

    // ---- termination -----------------------------------------------------

    /// Records that `id`'s view is all-HAVE. Survives the connection.
    pub fn note_remote_complete(&self, id: u32) {
        self.remote_complete.lock().insert(id);
    }

    /// Shuts the swarm down once we hold every piece and every roster peer
    /// has been seen complete.
    pub fn attempt_terminate(&self) {
        if self.shutting_down.load(Ordering::Acquire) || !self.store.is_complete() {
            return;
        }

        let everyone_done = {
            let done = self.remote_complete.lock();
            self.roster
                .remotes(self.local_id)
                .all(|peer| done.contains(&peer.id))
        };

        if everyone_done {
            self.shutdown();
        }
    }

    /// Deactivates every connection and wakes [`run`](Self::run).
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(peer = self.local_id, "swarm complete, closing connections");
        for entry in self.links.iter() {
            entry.value().state().deactivate();
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ---- choking scheduler slots -----------------------------------------

    pub(crate) fn set_preferred(&self, preferred: HashSet<u32>) {
        *self.preferred.lock() = preferred;
    }

    pub(crate) fn is_preferred(&self, id: u32) -> bool {
        self.preferred.lock().contains(&id)
    }

    pub(crate) fn replace_optimistic(&self, id: u32) -> Option<u32> {
        self.optimistic.lock().replace(id)
    }

    pub(crate) fn optimistic(&self) -> Option<u32> {
        *self.optimistic.lock()
    }
}

async fn accept_loop(swarm: Arc<Swarm>, listener: TcpListener) {
    let mut shutdown_rx = swarm.shutdown_watch();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    debug!(peer = swarm.local_id(), %addr, "accepted connection");
                    tokio::spawn(peer::run_connection(stream, None, false, swarm.clone()));
                }
                Err(e) => warn!(peer = swarm.local_id(), error = %e, "accept failed"),
            },
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Dials one earlier-listed peer, retrying while it may still be starting.
async fn dial_peer(swarm: Arc<Swarm>, target: PeerInfo) {
    let addr = format!("{}:{}", target.host, target.port);

    for attempt in 1..=DIAL_ATTEMPTS {
        if swarm.is_shutting_down() {
            return;
        }

        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(peer = target.id, %addr, "connected");
                peer::run_connection(stream, Some(target.id), true, swarm).await;
                return;
            }
            Err(e) => {
                debug!(peer = target.id, %addr, attempt, error = %e, "dial failed");
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
            }
        }
    }

    error!(peer = target.id, %addr, "giving up dialing peer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const FILE_NAME: &str = "payload.bin";

    fn test_config(file_size: u64, piece_size: u64, preferred: usize) -> CommonConfig {
        CommonConfig {
            preferred_neighbors: preferred,
            unchoking_interval: Duration::from_secs(1),
            optimistic_unchoking_interval: Duration::from_secs(1),
            file_name: FILE_NAME.to_string(),
            file_size,
            piece_size,
        }
    }

    /// Reserves `n` distinct ports by holding all the listeners at once.
    fn free_ports(n: usize) -> Vec<u16> {
        let sockets: Vec<std::net::TcpListener> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        sockets
            .iter()
            .map(|s| s.local_addr().unwrap().port())
            .collect()
    }

    fn localhost_roster(entries: &[(u32, u16, bool)]) -> PeerRoster {
        let text: String = entries
            .iter()
            .map(|(id, port, has_file)| {
                format!("{id} 127.0.0.1 {port} {}\n", u8::from(*has_file))
            })
            .collect();
        PeerRoster::parse(&text).unwrap()
    }

    fn patterned_file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn start_peer(
        id: u32,
        config: &CommonConfig,
        roster: &PeerRoster,
        dir: &Path,
    ) -> tokio::task::JoinHandle<Result<(), SwarmError>> {
        let swarm = Swarm::new(id, config.clone(), roster.clone(), dir.to_path_buf())
            .await
            .unwrap();
        tokio::spawn(swarm.run())
    }

    #[tokio::test]
    async fn seed_and_leech_exchange_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = patterned_file(64);
        storage::persist(dir.path(), 1, FILE_NAME, &file).await.unwrap();

        let config = test_config(64, 16, 1);
        let ports = free_ports(2);
        let roster = localhost_roster(&[(1, ports[0], true), (2, ports[1], false)]);

        let seed = start_peer(1, &config, &roster, dir.path()).await;
        let leech = start_peer(2, &config, &roster, dir.path()).await;

        tokio::time::timeout(Duration::from_secs(30), async {
            seed.await.unwrap().unwrap();
            leech.await.unwrap().unwrap();
        })
        .await
        .expect("swarm did not terminate");

        let copied = std::fs::read(dir.path().join("peer_2").join(FILE_NAME)).unwrap();
        assert_eq!(copied, file);
    }

    #[tokio::test]
    async fn short_final_piece_survives_transfer() {
        let dir = tempfile::tempdir().unwrap();
        // 5 pieces, the last one only 7 bytes.
        let file = patterned_file(71);
        storage::persist(dir.path(), 1, FILE_NAME, &file).await.unwrap();

        let config = test_config(71, 16, 1);
        let ports = free_ports(2);
        let roster = localhost_roster(&[(1, ports[0], true), (2, ports[1], false)]);

        let seed = start_peer(1, &config, &roster, dir.path()).await;
        let leech = start_peer(2, &config, &roster, dir.path()).await;

        tokio::time::timeout(Duration::from_secs(30), async {
            seed.await.unwrap().unwrap();
            leech.await.unwrap().unwrap();
        })
        .await
        .expect("swarm did not terminate");

        let copied = std::fs::read(dir.path().join("peer_2").join(FILE_NAME)).unwrap();
        assert_eq!(copied.len(), 71);
        assert_eq!(copied, file);
    }

    #[tokio::test]
    async fn three_peers_converge_from_one_seed() {
        let dir = tempfile::tempdir().unwrap();
        let file = patterned_file(128);
        storage::persist(dir.path(), 1, FILE_NAME, &file).await.unwrap();

        let config = test_config(128, 16, 2);
        let ports = free_ports(3);
        let roster = localhost_roster(&[
            (1, ports[0], true),
            (2, ports[1], false),
            (3, ports[2], false),
        ]);

        let tasks = vec![
            start_peer(1, &config, &roster, dir.path()).await,
            start_peer(2, &config, &roster, dir.path()).await,
            start_peer(3, &config, &roster, dir.path()).await,
        ];

        tokio::time::timeout(Duration::from_secs(60), async {
            for task in tasks {
                task.await.unwrap().unwrap();
            }
        })
        .await
        .expect("swarm did not terminate");

        for id in [2u32, 3] {
            let copied = std::fs::read(dir.path().join(format!("peer_{id}")).join(FILE_NAME))
                .unwrap();
            assert_eq!(copied, file, "peer {id} file differs");
        }
    }

    #[tokio::test]
    async fn all_seeds_terminate_without_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let file = patterned_file(64);
        storage::persist(dir.path(), 1, FILE_NAME, &file).await.unwrap();
        storage::persist(dir.path(), 2, FILE_NAME, &file).await.unwrap();

        let config = test_config(64, 16, 1);
        let ports = free_ports(2);
        let roster = localhost_roster(&[(1, ports[0], true), (2, ports[1], true)]);

        let first = start_peer(1, &config, &roster, dir.path()).await;
        let second = start_peer(2, &config, &roster, dir.path()).await;

        // Bitfield exchange alone is enough; no HAVE or PIECE ever flows.
        tokio::time::timeout(Duration::from_secs(15), async {
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();
        })
        .await
        .expect("all-seed swarm did not terminate");
    }

    #[tokio::test]
    async fn seed_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(64, 16, 1);
        let roster = localhost_roster(&[(1, free_ports(1)[0], true)]);

        let err = Swarm::new(1, config, roster, dir.path().to_path_buf())
            .await
            .err()
            .expect("seed without its file must fail");
        assert!(matches!(err, SwarmError::Storage(_)));
    }

    #[tokio::test]
    async fn unknown_local_id_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(64, 16, 1);
        let roster = localhost_roster(&[(1, free_ports(1)[0], false)]);

        let err = Swarm::new(9, config, roster, dir.path().to_path_buf())
            .await
            .err()
            .expect("peer id outside the roster must fail");
        assert!(matches!(err, SwarmError::Config(_)));
    }
}
