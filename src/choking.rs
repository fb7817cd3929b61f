//! The choking scheduler.
//!
//! Two periodic loops decide which interested peers may pull pieces from
//! us. The preferred-neighbor loop reciprocates: every unchoking interval
//! it ranks interested peers by what they delivered to us since the last
//! rotation and unchokes the top `NumberOfPreferredNeighbors`. The
//! optimistic loop grants one randomly chosen choked peer an exploratory
//! slot. These loops are the only writers of the per-connection
//! `local_choke` flag.

use crate::peer::{Packet, PeerLink};
use crate::swarm::Swarm;
use rand::seq::SliceRandom;
use rand::Rng as _;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Starts both scheduler loops.
pub fn spawn(swarm: Arc<Swarm>) {
    tokio::spawn(run_preferred(swarm.clone()));
    tokio::spawn(run_optimistic(swarm));
}

async fn run_preferred(swarm: Arc<Swarm>) {
    let mut shutdown_rx = swarm.shutdown_watch();
    let mut tick = tokio::time::interval(swarm.config().unchoking_interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => rotate_preferred(&swarm).await,
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn run_optimistic(swarm: Arc<Swarm>) {
    let mut shutdown_rx = swarm.shutdown_watch();
    let mut tick = tokio::time::interval(swarm.config().optimistic_unchoking_interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => rotate_optimistic(&swarm).await,
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// One preferred-neighbor rotation: rank, transition choke states, reset
/// the download counters for the next interval.
async fn rotate_preferred(swarm: &Swarm) {
    let links = swarm.active_links();
    let interested: Vec<(u32, Arc<PeerLink>)> = links
        .iter()
        .filter(|(_, link)| link.state().is_interested())
        .cloned()
        .collect();

    let rates: Vec<(u32, u64)> = interested
        .iter()
        .map(|(id, link)| (*id, link.state().downloaded()))
        .collect();
    let chosen = rank_preferred(
        rates,
        swarm.config().preferred_neighbors,
        !swarm.store().is_complete(),
    );

    if !chosen.is_empty() {
        debug!(preferred = ?chosen, "preferred neighbors rotated");
    }
    swarm.set_preferred(chosen.clone());
    let optimistic = swarm.optimistic();

    for (id, link) in &interested {
        let choked = link.state().is_local_choked();

        if chosen.contains(id) {
            if choked {
                link.state().set_local_choke(false);
                let _ = link.send(Packet::Unchoke).await;
                info!(peer = id, "unchoked as preferred neighbor");
            }
        } else if !choked && Some(*id) != optimistic {
            link.state().set_local_choke(true);
            let _ = link.send(Packet::Choke).await;
            info!(peer = id, "choked");
        }
    }

    for (_, link) in &links {
        link.state().reset_downloaded();
    }
}

/// Picks the preferred set: top `k` by delivered bytes while we still
/// download, uniformly random once we are complete. Ties break randomly:
/// the shuffle runs first and the sort is stable, so equal rates keep
/// their shuffled order.
fn rank_preferred(mut candidates: Vec<(u32, u64)>, k: usize, by_rate: bool) -> HashSet<u32> {
    candidates.shuffle(&mut rand::rng());
    if by_rate {
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
    }
    candidates.into_iter().take(k).map(|(id, _)| id).collect()
}

/// One optimistic rotation: unchoke a random interested-but-choked peer and
/// re-apply the preferred policy to whoever held the slot before.
async fn rotate_optimistic(swarm: &Swarm) {
    let links = swarm.active_links();
    let candidates: Vec<(u32, Arc<PeerLink>)> = links
        .into_iter()
        .filter(|(_, link)| link.state().is_interested() && link.state().is_local_choked())
        .collect();

    if candidates.is_empty() {
        return;
    }

    let (id, link) = &candidates[rand::rng().random_range(0..candidates.len())];
    let previous = swarm.replace_optimistic(*id);

    link.state().set_local_choke(false);
    let _ = link.send(Packet::Unchoke).await;
    info!(peer = id, "optimistic unchoke");

    if let Some(prev) = previous {
        if prev != *id && !swarm.is_preferred(prev) {
            if let Some(prev_link) = swarm.link(prev) {
                if !prev_link.state().is_local_choked() {
                    prev_link.state().set_local_choke(true);
                    let _ = prev_link.send(Packet::Choke).await;
                    info!(peer = prev, "choked after losing optimistic slot");
                }
            }
        }
    }
}
