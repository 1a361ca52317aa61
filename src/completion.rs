//! Per-piece / per-block "have" and "requested" accounting (spec.md §3,
//! §4.2).
//!
//! `Completion` only tracks what has been written and what has been asked
//! for; it never performs verification itself. When `block_add` causes every
//! block of a piece to be present, the piece becomes a *candidate* for
//! verification and `block_add` reports this back to the caller (normally
//! the torrent actor), which is expected to drive `Storage::verify` and then
//! call `mark_piece_verified` or `clear_piece`.

use crate::{bitfield::Bitfield, block_count, PieceIndex};

/// Overall download status, derived from per-piece verification and DND
/// flags (spec.md §4.2, Glossary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Incomplete,
    Done,
    Complete,
}

pub(crate) struct Completion {
    /// One bit per block across the whole torrent: whether it has been
    /// written to disk (not necessarily verified).
    have: Bitfield,
    /// One bit per block across the whole torrent: whether it is currently
    /// the subject of an outstanding request to some peer.
    requested: Bitfield,
    /// One bit per piece: whether `Storage::verify` has succeeded for it.
    verified: Bitfield,
    /// Prefix sums of per-piece block counts; `piece_block_range(p)` is
    /// `block_offsets[p]..block_offsets[p + 1]`.
    block_offsets: Vec<usize>,
    /// Per-piece length, needed to translate piece completion into bytes
    /// remaining for `left_until_done`.
    piece_lens: Vec<u32>,
    /// Per-piece do-not-download flag.
    dnd: Vec<bool>,
    /// Cached byte total of non-DND pieces not yet verified; invalidated by
    /// `invalidate_dnd_cache` whenever DND flags change.
    dnd_cache: Option<u64>,
    /// The status as of the last call to `status()`, used to edge-trigger
    /// transition notifications.
    last_status: Status,
}

impl Completion {
    /// Creates a new `Completion` for a torrent whose pieces have the given
    /// lengths (in byte order) and DND flags.
    pub fn new(piece_lens: &[u32], dnd: Vec<bool>) -> Self {
        debug_assert_eq!(piece_lens.len(), dnd.len());
        let mut block_offsets = Vec::with_capacity(piece_lens.len() + 1);
        let mut offset = 0;
        for &len in piece_lens {
            block_offsets.push(offset);
            offset += block_count(len);
        }
        block_offsets.push(offset);
        let total_blocks = offset;

        let mut completion = Self {
            have: Bitfield::new(total_blocks),
            requested: Bitfield::new(total_blocks),
            verified: Bitfield::new(piece_lens.len()),
            block_offsets,
            piece_lens: piece_lens.to_vec(),
            dnd,
            dnd_cache: None,
            last_status: Status::Incomplete,
        };
        completion.invalidate_dnd_cache();
        completion
    }

    fn piece_block_range(&self, piece: PieceIndex) -> std::ops::Range<usize> {
        self.block_offsets[piece]..self.block_offsets[piece + 1]
    }

    /// Maps a block to its torrent-wide block index, for use as the argument
    /// to `block_add`/`block_remove`/`mark_requested`.
    pub fn global_block_index(&self, block: &crate::BlockInfo) -> usize {
        self.block_offsets[block.piece_index] + block.index_in_piece()
    }

    fn piece_count(&self) -> usize {
        self.piece_lens.len()
    }

    /// Marks a block as present. Idempotent. Returns true if this was the
    /// last missing block of its piece, i.e. the piece is now a candidate
    /// for verification.
    pub fn block_add(&mut self, global_block_index: usize) -> bool {
        self.have.set(global_block_index);
        self.requested.clear(global_block_index);
        let piece = self.piece_of_block(global_block_index);
        self.piece_blocks_complete(piece)
    }

    /// Removes a block from `have`. Restores the piece-level status to
    /// whatever it was before the corresponding `block_add` (spec.md §8,
    /// invariant 2).
    pub fn block_remove(&mut self, global_block_index: usize) {
        self.have.clear(global_block_index);
        let piece = self.piece_of_block(global_block_index);
        self.verified.clear(piece);
    }

    pub fn block_is_complete(&self, global_block_index: usize) -> bool {
        self.have.test(global_block_index)
    }

    pub fn mark_requested(&mut self, global_block_index: usize) {
        self.requested.set(global_block_index);
    }

    pub fn unmark_requested(&mut self, global_block_index: usize) {
        self.requested.clear(global_block_index);
    }

    pub fn is_requested(&self, global_block_index: usize) -> bool {
        self.requested.test(global_block_index)
    }

    /// True iff every block of `piece` not yet present is already requested,
    /// by this or another session, so picking this piece again would add no
    /// new pipelined request (spec.md §4.5(b): only request blocks "not
    /// currently requested by another session").
    pub fn piece_fully_requested(&self, piece: PieceIndex) -> bool {
        self.piece_block_range(piece)
            .all(|b| self.have.test(b) || self.requested.test(b))
    }

    fn piece_of_block(&self, global_block_index: usize) -> PieceIndex {
        match self.block_offsets.binary_search(&global_block_index) {
            Ok(p) => p,
            Err(p) => p - 1,
        }
    }

    fn piece_blocks_complete(&self, piece: PieceIndex) -> bool {
        self.piece_block_range(piece).all(|b| self.have.test(b))
    }

    /// Marks `piece` as verified. Called by the engine after
    /// `Storage::verify` succeeds.
    pub fn mark_piece_verified(&mut self, piece: PieceIndex) {
        self.verified.set(piece);
        self.invalidate_dnd_cache();
    }

    /// Clears every block of `piece` (and its verified bit), e.g. after a
    /// hash verification failure (spec.md §4.5, S3).
    pub fn clear_piece(&mut self, piece: PieceIndex) {
        for b in self.piece_block_range(piece) {
            self.have.clear(b);
            self.requested.clear(b);
        }
        self.verified.clear(piece);
        self.invalidate_dnd_cache();
    }

    /// A piece is complete iff all its blocks are present and it has been
    /// verified (spec.md §3).
    pub fn piece_is_complete(&self, piece: PieceIndex) -> bool {
        self.verified.test(piece)
    }

    /// Projects block-level completeness to piece-level for wire BITFIELD.
    pub fn piece_bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::new(self.piece_count());
        for p in 0..self.piece_count() {
            if self.piece_is_complete(p) {
                bf.set(p);
            }
        }
        bf
    }

    pub fn set_dnd(&mut self, piece: PieceIndex, dnd: bool) {
        self.dnd[piece] = dnd;
        self.invalidate_dnd_cache();
    }

    pub fn is_dnd(&self, piece: PieceIndex) -> bool {
        self.dnd[piece]
    }

    /// Recomputes the cached count of non-DND bytes not yet verified. Called
    /// whenever a DND flag or a piece's verified state changes.
    pub fn invalidate_dnd_cache(&mut self) {
        let left: u64 = (0..self.piece_count())
            .filter(|&p| !self.dnd[p] && !self.piece_is_complete(p))
            .map(|p| self.piece_lens[p] as u64)
            .sum();
        self.dnd_cache = Some(left);
    }

    /// The number of bytes still needed to reach "Done" (spec.md §4.2,
    /// Glossary).
    pub fn left_until_done(&self) -> u64 {
        self.dnd_cache.unwrap_or(0)
    }

    /// Fraction of non-DND bytes verified, in `[0.0, 1.0]`.
    pub fn percent_done(&self) -> f32 {
        let total: u64 = (0..self.piece_count())
            .filter(|&p| !self.dnd[p])
            .map(|p| self.piece_lens[p] as u64)
            .sum();
        if total == 0 {
            return 1.0;
        }
        let done = total - self.left_until_done();
        done as f32 / total as f32
    }

    /// Fraction of *all* bytes verified, ignoring DND (spec.md S5:
    /// `percentComplete` may lag `percentDone` while pieces are DND).
    pub fn percent_complete(&self) -> f32 {
        let total: u64 = self.piece_lens.iter().map(|&l| l as u64).sum();
        if total == 0 {
            return 1.0;
        }
        let done: u64 = (0..self.piece_count())
            .filter(|&p| self.piece_is_complete(p))
            .map(|p| self.piece_lens[p] as u64)
            .sum();
        done as f32 / total as f32
    }

    fn compute_status(&self) -> Status {
        let all_verified = (0..self.piece_count()).all(|p| self.piece_is_complete(p));
        if all_verified {
            return Status::Complete;
        }
        let all_non_dnd_verified = (0..self.piece_count())
            .filter(|&p| !self.dnd[p])
            .all(|p| self.piece_is_complete(p));
        if all_non_dnd_verified {
            Status::Done
        } else {
            Status::Incomplete
        }
    }

    /// Returns the current status, and, if it differs from the status as of
    /// the last call, `Some(new_status)` so the engine can edge-trigger a
    /// one-time notification (spec.md §4.2: "Transitions are edge-triggered:
    /// the engine observes each change exactly once").
    pub fn status_transition(&mut self) -> (Status, Option<Status>) {
        let current = self.compute_status();
        let transition = if current != self.last_status {
            Some(current)
        } else {
            None
        };
        self.last_status = current;
        (current, transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(piece_lens: &[u32]) -> Completion {
        Completion::new(piece_lens, vec![false; piece_lens.len()])
    }

    #[test]
    fn test_block_add_idempotent_and_piece_completion() {
        // one piece of exactly one block
        let mut c = completion(&[16384]);
        assert!(!c.piece_is_complete(0));
        assert!(c.block_add(0), "adding the only block completes the piece");
        assert!(c.block_add(0), "idempotent: re-adding still reports complete");
        assert!(!c.piece_is_complete(0), "completion itself never verifies");
        c.mark_piece_verified(0);
        assert!(c.piece_is_complete(0));
    }

    #[test]
    fn test_block_add_then_remove_restores_prior_status() {
        let mut c = completion(&[16384]);
        c.block_add(0);
        c.mark_piece_verified(0);
        assert!(c.piece_is_complete(0));
        c.block_remove(0);
        assert!(!c.piece_is_complete(0));
        assert!(!c.block_is_complete(0));
    }

    #[test]
    fn test_multi_block_piece_needs_all_blocks() {
        // two blocks in piece 0 (32 KiB = 2 * 16 KiB)
        let mut c = completion(&[32768]);
        assert!(!c.block_add(0));
        assert!(c.block_add(1));
    }

    #[test]
    fn test_clear_piece_on_verify_failure() {
        let mut c = completion(&[32768]);
        c.block_add(0);
        c.block_add(1);
        c.clear_piece(0);
        assert!(!c.block_is_complete(0));
        assert!(!c.block_is_complete(1));
        assert!(!c.piece_is_complete(0));
    }

    #[test]
    fn test_dnd_done_vs_complete() {
        // two pieces, second is DND
        let mut c = Completion::new(&[16384, 16384], vec![false, true]);
        c.block_add(0);
        c.mark_piece_verified(0);
        let (status, _) = c.status_transition();
        assert_eq!(status, Status::Done);
        assert_eq!(c.percent_done(), 1.0);
        assert!(c.percent_complete() < 1.0);

        // flipping DND off re-enters Incomplete
        c.set_dnd(1, false);
        let (status, transition) = c.status_transition();
        assert_eq!(status, Status::Incomplete);
        assert_eq!(transition, Some(Status::Incomplete));
    }

    #[test]
    fn test_status_transition_is_edge_triggered() {
        let mut c = completion(&[16384]);
        let (status, transition) = c.status_transition();
        assert_eq!(status, Status::Incomplete);
        assert_eq!(transition, None, "first observation at steady state is not a transition");

        c.block_add(0);
        c.mark_piece_verified(0);
        let (status, transition) = c.status_transition();
        assert_eq!(status, Status::Complete);
        assert_eq!(transition, Some(Status::Complete));

        // observing again without change reports no transition
        let (_, transition) = c.status_transition();
        assert_eq!(transition, None);
    }

    #[test]
    fn test_piece_bitfield_projection() {
        let mut c = Completion::new(&[16384, 16384, 16384], vec![false; 3]);
        c.block_add(c.block_offsets[1]);
        c.mark_piece_verified(1);
        let bf = c.piece_bitfield();
        assert!(!bf.test(0));
        assert!(bf.test(1));
        assert!(!bf.test(2));
    }
}
