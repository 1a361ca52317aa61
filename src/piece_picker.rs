//! Picks the next most optimal piece(s) to download: rarest-first across
//! the swarm's aggregated `have` counts, with `High` priority pieces
//! considered before `Normal` ones (spec.md §4.5).
//!
//! This is deliberately kept separate from [`crate::completion::Completion`]:
//! `Completion` tracks what *we* have, `PiecePicker` tracks what the *swarm*
//! has and which pieces we'd prefer to fetch first.

use crate::{bitfield::Bitfield, storage_info::StorageInfo, PieceIndex, Priority};

pub(crate) struct PiecePicker {
    /// For each piece, the number of currently connected peers known to have
    /// it. Used to implement rarest-first selection.
    availability: Vec<u32>,
    /// Per-piece download priority.
    priority: Vec<Priority>,
    /// Per-piece do-not-download flag; DND pieces are never picked.
    dnd: Vec<bool>,
}

impl PiecePicker {
    /// Builds a picker for `storage`, promoting the first and last piece of
    /// every file to `High` priority to enable progressive preview (spec.md
    /// §4.5).
    pub fn new(storage: &StorageInfo) -> Self {
        let piece_count = storage.piece_count;
        let mut priority = vec![Priority::Normal; piece_count];

        let promote = |priority: &mut Vec<Priority>, byte_offset: u64, len: u64| {
            if len == 0 {
                return;
            }
            let first_piece = (byte_offset / storage.piece_len as u64) as usize;
            let last_byte = byte_offset + len - 1;
            let last_piece = (last_byte / storage.piece_len as u64) as usize;
            if let Some(p) = priority.get_mut(first_piece) {
                *p = Priority::High;
            }
            if let Some(p) = priority.get_mut(last_piece) {
                *p = Priority::High;
            }
        };

        match &storage.structure {
            crate::storage_info::FsStructure::File(file) => {
                promote(&mut priority, file.torrent_offset, file.len);
            }
            crate::storage_info::FsStructure::Archive { files } => {
                for file in files {
                    promote(&mut priority, file.torrent_offset, file.len);
                }
            }
        }

        Self {
            availability: vec![0; piece_count],
            priority,
            dnd: vec![false; piece_count],
        }
    }

    fn piece_count(&self) -> usize {
        self.availability.len()
    }

    /// A snapshot of per-piece swarm availability, for `getPieceAvailability`
    /// (spec.md §6).
    pub fn availability_snapshot(&self) -> Vec<u32> {
        self.availability.clone()
    }

    /// Registers a newly connected peer's full bitfield, incrementing
    /// availability for every piece they have.
    pub fn register_availability(&mut self, have: &Bitfield) {
        for p in have.iter_ones() {
            if let Some(count) = self.availability.get_mut(p) {
                *count += 1;
            }
        }
    }

    /// Registers a single HAVE announcement from a peer.
    pub fn announce_have(&mut self, piece: PieceIndex) {
        if let Some(count) = self.availability.get_mut(piece) {
            *count += 1;
        }
    }

    /// Removes a disconnected peer's contribution to availability counts.
    pub fn forget_peer(&mut self, have: &Bitfield) {
        for p in have.iter_ones() {
            if let Some(count) = self.availability.get_mut(p) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn set_priority(&mut self, piece: PieceIndex, priority: Priority) {
        self.priority[piece] = priority;
    }

    pub fn set_dnd(&mut self, piece: PieceIndex, dnd: bool) {
        self.dnd[piece] = dnd;
    }

    pub fn priority(&self, piece: PieceIndex) -> Priority {
        self.priority[piece]
    }

    pub fn is_dnd(&self, piece: PieceIndex) -> bool {
        self.dnd[piece]
    }

    /// A piece is interesting iff it's not DND, not yet complete, the peer
    /// has it, and it isn't in `banned` (spec.md §4.5's interest predicate).
    pub fn is_interesting(
        &self,
        piece: PieceIndex,
        peer_have: &Bitfield,
        is_piece_complete: impl Fn(PieceIndex) -> bool,
        banned: impl Fn(PieceIndex) -> bool,
    ) -> bool {
        !self.dnd[piece]
            && !is_piece_complete(piece)
            && piece < peer_have.len()
            && peer_have.test(piece)
            && !banned(piece)
    }

    /// Picks the next piece to request from a peer, preferring `High`
    /// priority pieces, then rarest-first among the rest, restricted to
    /// pieces the peer has, we don't, that aren't banned, and that still
    /// have at least one block not already requested of some other session
    /// (`fully_requested`, spec.md §4.5(b)).
    pub fn pick_piece(
        &self,
        peer_have: &Bitfield,
        is_piece_complete: impl Fn(PieceIndex) -> bool,
        banned: impl Fn(PieceIndex) -> bool,
        fully_requested: impl Fn(PieceIndex) -> bool,
    ) -> Option<PieceIndex> {
        let candidates = (0..self.piece_count()).filter(|&p| {
            self.is_interesting(p, peer_have, &is_piece_complete, &banned) && !fully_requested(p)
        });

        // prefer High priority pieces outright; within a priority tier, pick
        // the piece with the lowest swarm availability (rarest-first)
        candidates.min_by_key(|&p| {
            let priority_rank = match self.priority[p] {
                Priority::High => 0,
                Priority::Normal => 1,
            };
            (priority_rank, self.availability[p], p)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{File, Info, Metainfo};
    use crate::storage_info::StorageInfo;
    use std::path::PathBuf;

    fn archive_storage() -> StorageInfo {
        let metainfo = Metainfo {
            info: Info {
                name: "album".into(),
                pieces: vec![0u8; 20 * 4],
                piece_length: 16,
                length: None,
                files: Some(vec![
                    File {
                        path: vec!["a".into()],
                        length: 20,
                    },
                    File {
                        path: vec!["b".into()],
                        length: 44,
                    },
                ]),
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        StorageInfo::new(&metainfo, PathBuf::from("/tmp"))
    }

    #[test]
    fn test_first_last_piece_promoted_to_high() {
        let storage = archive_storage();
        let picker = PiecePicker::new(&storage);
        // file a: bytes 0..20 -> pieces 0,1; file b: bytes 20..64 -> pieces 1,2,3
        assert_eq!(picker.priority(0), Priority::High);
        assert_eq!(picker.priority(3), Priority::High);
    }

    #[test]
    fn test_rarest_first_selection() {
        let storage = archive_storage();
        let mut picker = PiecePicker::new(&storage);
        let piece_count = storage.piece_count;

        let mut peer_have = Bitfield::new(piece_count);
        peer_have.set_range(0, piece_count);

        // make piece 2 rarer than the rest by not registering other peers
        // for it, while bumping availability of pieces 0,1,3
        let mut other_have = Bitfield::new(piece_count);
        other_have.set(0);
        other_have.set(1);
        other_have.set(3);
        picker.register_availability(&other_have);
        picker.register_availability(&other_have);

        // pieces 0 and 3 are High (promoted); piece 2 is Normal with lowest
        // availability among Normal pieces (0, since no peer announced it)
        let picked = picker.pick_piece(&peer_have, |_| false, |_| false, |_| false);
        // High priority wins regardless of availability
        assert!(picked == Some(0) || picked == Some(3));
    }

    #[test]
    fn test_dnd_piece_never_interesting() {
        let storage = archive_storage();
        let mut picker = PiecePicker::new(&storage);
        picker.set_dnd(1, true);
        let mut peer_have = Bitfield::new(storage.piece_count);
        peer_have.set(1);
        assert!(!picker.is_interesting(1, &peer_have, |_| false, |_| false));
    }

    #[test]
    fn test_banned_piece_not_picked() {
        let storage = archive_storage();
        let picker = PiecePicker::new(&storage);
        let mut peer_have = Bitfield::new(storage.piece_count);
        peer_have.set_range(0, storage.piece_count);
        let picked = picker.pick_piece(&peer_have, |_| false, |p| p != 2, |_| false);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn test_fully_requested_piece_not_picked() {
        let storage = archive_storage();
        let picker = PiecePicker::new(&storage);
        let mut peer_have = Bitfield::new(storage.piece_count);
        peer_have.set_range(0, storage.piece_count);
        // every piece but 2 reports as fully requested elsewhere
        let picked = picker.pick_piece(&peer_have, |_| false, |_| false, |p| p != 2);
        assert_eq!(picked, Some(2));
    }
}
