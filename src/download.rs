//! Tracks the state of a single in-progress piece download within one peer
//! session: which of its blocks have been requested and which have been
//! received (spec.md §4.5's request pipeline).

use std::collections::HashSet;

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// An in-progress piece download, scoped to a single peer session. Multiple
/// sessions may have their own `PieceDownload` for the same piece index;
/// `pick_blocks` takes the torrent-wide `Completion::is_requested` check as a
/// predicate so a block another session already has pipelined is never
/// handed out twice.
pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    /// Blocks we've requested from this peer for this piece but haven't yet
    /// received.
    pending: HashSet<usize>,
    /// Blocks we've received from this peer for this piece.
    received: HashSet<usize>,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        Self {
            piece_index,
            piece_len,
            pending: HashSet::new(),
            received: HashSet::new(),
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    /// Picks up to `count` blocks that are neither pending nor received yet
    /// in this session, and for which `is_requested_elsewhere` reports false,
    /// appending them to `out` as concrete `BlockInfo`s ready to send as
    /// REQUEST messages (spec.md §4.5(b)).
    pub fn pick_blocks(
        &mut self,
        count: usize,
        out: &mut Vec<BlockInfo>,
        is_requested_elsewhere: impl Fn(&BlockInfo) -> bool,
    ) {
        let total_blocks = block_count(self.piece_len);
        let mut picked = 0;
        for index_in_piece in 0..total_blocks {
            if picked >= count {
                break;
            }
            if self.pending.contains(&index_in_piece)
                || self.received.contains(&index_in_piece)
            {
                continue;
            }
            let block = BlockInfo {
                piece_index: self.piece_index,
                offset: index_in_piece as u32 * crate::BLOCK_LEN,
                len: block_len(self.piece_len, index_in_piece),
            };
            if is_requested_elsewhere(&block) {
                continue;
            }
            self.pending.insert(index_in_piece);
            out.push(block);
            picked += 1;
        }
    }

    /// Records that a block has arrived, moving it from `pending` to
    /// `received`.
    pub fn received_block(&mut self, block: BlockInfo) {
        debug_assert_eq!(block.piece_index, self.piece_index);
        let index_in_piece = block.index_in_piece();
        self.pending.remove(&index_in_piece);
        self.received.insert(index_in_piece);
    }

    /// Drops all pending (not yet received) block requests, e.g. because the
    /// peer choked us (spec.md §4.5: "all outbound requests are dropped from
    /// `requested` so other peers may pick them up").
    pub fn clear_pending(&mut self) -> Vec<BlockInfo> {
        let dropped: Vec<BlockInfo> = self
            .pending
            .drain()
            .map(|index_in_piece| BlockInfo {
                piece_index: self.piece_index,
                offset: index_in_piece as u32 * crate::BLOCK_LEN,
                len: block_len(self.piece_len, index_in_piece),
            })
            .collect();
        dropped
    }

    pub fn count_missing_blocks(&self) -> usize {
        block_count(self.piece_len) - self.received.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_blocks_respects_count_and_avoids_duplicates() {
        let mut dl = PieceDownload::new(0, 3 * crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        dl.pick_blocks(2, &mut blocks, |_| false);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, crate::BLOCK_LEN);

        let mut more = Vec::new();
        dl.pick_blocks(5, &mut more, |_| false);
        // only one block left (index 2), even though 5 were requested
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].offset, 2 * crate::BLOCK_LEN);
    }

    #[test]
    fn test_pick_blocks_skips_blocks_requested_elsewhere() {
        let mut dl = PieceDownload::new(0, 3 * crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        // block at offset BLOCK_LEN (index 1) is already pipelined to
        // another session
        dl.pick_blocks(3, &mut blocks, |b| b.offset == crate::BLOCK_LEN);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 2 * crate::BLOCK_LEN);
    }

    #[test]
    fn test_received_block_and_missing_count() {
        let mut dl = PieceDownload::new(0, 2 * crate::BLOCK_LEN);
        assert_eq!(dl.count_missing_blocks(), 2);
        dl.received_block(BlockInfo {
            piece_index: 0,
            offset: 0,
            len: crate::BLOCK_LEN,
        });
        assert_eq!(dl.count_missing_blocks(), 1);
    }

    #[test]
    fn test_clear_pending_on_choke() {
        let mut dl = PieceDownload::new(0, 2 * crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        dl.pick_blocks(2, &mut blocks, |_| false);
        let dropped = dl.clear_pending();
        assert_eq!(dropped.len(), 2);
        // after clearing, the same blocks can be picked again
        let mut again = Vec::new();
        dl.pick_blocks(2, &mut again, |_| false);
        assert_eq!(again.len(), 2);
    }
}
