//! The local piece array.
//!
//! All mutation of the local pieces goes through [`PieceStore`], which holds
//! the array behind a single lock. Piece payloads are immutable [`Bytes`]
//! once written, so readers that obtained a payload may use it after
//! releasing the lock.

use crate::peer::Bitfield;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng as _;

/// Where a piece stands locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// Held, payload present.
    Have,
    /// Not held, not asked for.
    NotHave,
    /// A REQUEST for it is in flight to some peer.
    Requested,
}

#[derive(Debug)]
struct Slot {
    status: PieceStatus,
    data: Option<Bytes>,
}

/// The local peer's pieces.
pub struct PieceStore {
    slots: Mutex<Vec<Slot>>,
    piece_size: u64,
    file_size: u64,
}

impl PieceStore {
    /// A store holding nothing.
    pub fn empty(piece_size: u64, file_size: u64) -> Self {
        let count = file_size.div_ceil(piece_size) as usize;
        let slots = (0..count)
            .map(|_| Slot {
                status: PieceStatus::NotHave,
                data: None,
            })
            .collect();

        Self {
            slots: Mutex::new(slots),
            piece_size,
            file_size,
        }
    }

    /// A store seeded with the complete file, split into pieces.
    pub fn seeded(file: Bytes, piece_size: u64, file_size: u64) -> Self {
        let count = file_size.div_ceil(piece_size) as usize;
        let slots = (0..count)
            .map(|index| {
                let start = index as u64 * piece_size;
                let end = (start + piece_size).min(file_size);
                Slot {
                    status: PieceStatus::Have,
                    data: Some(file.slice(start as usize..end as usize)),
                }
            })
            .collect();

        Self {
            slots: Mutex::new(slots),
            piece_size,
            file_size,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Length of piece `index`; only the final piece can be short.
    pub fn piece_len(&self, index: usize) -> usize {
        let start = index as u64 * self.piece_size;
        (self.piece_size.min(self.file_size - start)) as usize
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn has(&self, index: usize) -> bool {
        self.slots
            .lock()
            .get(index)
            .is_some_and(|s| s.status == PieceStatus::Have)
    }

    /// Number of pieces held.
    pub fn held(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.status == PieceStatus::Have)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots
            .lock()
            .iter()
            .all(|s| s.status == PieceStatus::Have)
    }

    /// The payload of a held piece.
    pub fn content(&self, index: usize) -> Option<Bytes> {
        self.slots.lock().get(index).and_then(|s| s.data.clone())
    }

    /// Our side of a BITFIELD packet.
    pub fn bitfield(&self) -> Bitfield {
        let slots = self.slots.lock();
        let mut bf = Bitfield::new(slots.len());
        for (index, slot) in slots.iter().enumerate() {
            if slot.status == PieceStatus::Have {
                bf.set(index);
            }
        }
        bf
    }

    /// Stores a received piece. Returns `false` if the piece was already
    /// held (the payload is kept as first written) and `true` when this
    /// call transitioned it to held.
    pub fn set_have(&self, index: usize, data: Bytes) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(index) else {
            return false;
        };
        if slot.status == PieceStatus::Have {
            return false;
        }
        slot.status = PieceStatus::Have;
        slot.data = Some(data);
        true
    }

    /// Picks a piece to request from a peer with view `remote`: uniformly
    /// random over indices we lack and the remote holds, marking the winner
    /// `Requested` so no other connection asks for it concurrently.
    pub fn claim(&self, remote: &Bitfield) -> Option<u32> {
        let mut slots = self.slots.lock();
        let candidates: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(index, slot)| slot.status == PieceStatus::NotHave && remote.has(*index))
            .map(|(index, _)| index)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let index = candidates[rand::rng().random_range(0..candidates.len())];
        slots[index].status = PieceStatus::Requested;
        Some(index as u32)
    }

    /// Returns a `Requested` piece to `NotHave` so it can be claimed again;
    /// used when the remote chokes us or the connection dies before the
    /// piece arrives.
    pub fn release(&self, index: u32) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index as usize) {
            if slot.status == PieceStatus::Requested {
                slot.status = PieceStatus::NotHave;
            }
        }
    }

    /// Whether the remote holds anything we still lack.
    pub fn interested_in(&self, remote: &Bitfield) -> bool {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .any(|(index, slot)| slot.status == PieceStatus::NotHave && remote.has(index))
    }

    /// Concatenates all pieces, truncated to the file size. `None` until
    /// the store is complete.
    pub fn assemble(&self) -> Option<Bytes> {
        let slots = self.slots.lock();
        let mut out = Vec::with_capacity(self.file_size as usize);
        for slot in slots.iter() {
            out.extend_from_slice(slot.data.as_deref()?);
        }
        out.truncate(self.file_size as usize);
        Some(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_view(count: usize) -> Bitfield {
        let mut bf = Bitfield::new(count);
        for i in 0..count {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn seeded_store_splits_with_short_tail() {
        let file = Bytes::from(vec![7u8; 100]);
        let store = PieceStore::seeded(file, 32, 100);

        assert_eq!(store.piece_count(), 4);
        assert!(store.is_complete());
        assert_eq!(store.piece_len(3), 4);
        assert_eq!(store.content(3).unwrap().len(), 4);
        assert_eq!(store.assemble().unwrap().len(), 100);
    }

    #[test]
    fn claim_marks_requested_and_exhausts() {
        let store = PieceStore::empty(16, 64);
        let view = full_view(4);

        let mut claimed = Vec::new();
        for _ in 0..4 {
            claimed.push(store.claim(&view).unwrap());
        }
        claimed.sort_unstable();
        assert_eq!(claimed, vec![0, 1, 2, 3]);

        // Everything is now Requested; nothing left to claim.
        assert!(store.claim(&view).is_none());
        assert!(!store.is_complete());
    }

    #[test]
    fn release_returns_piece_to_pool() {
        let store = PieceStore::empty(16, 32);
        let view = full_view(2);

        let first = store.claim(&view).unwrap();
        let second = store.claim(&view).unwrap();
        assert!(store.claim(&view).is_none());

        store.release(first);
        assert_eq!(store.claim(&view), Some(first));

        // Releasing a held piece is a no-op.
        store.set_have(second as usize, Bytes::from(vec![0u8; 16]));
        store.release(second);
        assert!(store.has(second as usize));
    }

    #[test]
    fn set_have_is_idempotent() {
        let store = PieceStore::empty(16, 32);
        assert!(store.set_have(0, Bytes::from(vec![1u8; 16])));
        assert!(!store.set_have(0, Bytes::from(vec![2u8; 16])));
        assert_eq!(store.content(0).unwrap()[0], 1);
    }

    #[test]
    fn interest_tracks_missing_pieces_only() {
        let store = PieceStore::empty(16, 48);
        let mut view = Bitfield::new(3);
        assert!(!store.interested_in(&view));

        view.set(1);
        assert!(store.interested_in(&view));

        store.set_have(1, Bytes::from(vec![0u8; 16]));
        assert!(!store.interested_in(&view));

        // A piece we already requested elsewhere does not count as wanted.
        view.set(2);
        let claimed = store.claim(&view).unwrap();
        assert_eq!(claimed, 2);
        assert!(!store.interested_in(&view));
    }

    #[test]
    fn assemble_requires_completion() {
        let store = PieceStore::empty(16, 32);
        assert!(store.assemble().is_none());

        store.set_have(0, Bytes::from(vec![1u8; 16]));
        store.set_have(1, Bytes::from(vec![2u8; 16]));

        let data = store.assemble().unwrap();
        assert_eq!(&data[..16], &[1u8; 16][..]);
        assert_eq!(&data[16..], &[2u8; 16][..]);
    }
}
