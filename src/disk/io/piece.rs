//! An in-progress piece write buffer, and the free function used to read a
//! whole piece back off disk for the read cache.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use sha1::{Digest, Sha1};

use crate::disk::error::*;
use crate::disk::io::file::TorrentFile;
use crate::iovecs::IoVecs;
use crate::{block_count, CachedBlock, FileIndex, Sha1Hash};
use nix::sys::uio::IoVec;

/// An in-progress piece download that keeps in memory the so-far-downloaded
/// blocks and the expected hash of the piece. Once complete, its blocks are
/// hashed and, if valid, written to disk.
pub(crate) struct Piece {
    pub expected_hash: Sha1Hash,
    pub len: u32,
    /// Blocks received so far, mapped by their offset within the piece. A
    /// `BTreeMap` keeps keys sorted, which matters when hashing blocks in
    /// order.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// The left-inclusive range of file indices this piece overlaps with.
    pub file_range: Range<FileIndex>,
}

impl Piece {
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Hashes all of the piece's blocks in order and compares against the
    /// expected hash. Long running; must be called off the async executor.
    pub fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files it overlaps with. Performs
    /// synchronous IO; must be called off the async executor.
    pub fn write(&self, piece_torrent_offset: u64, files: &[RwLock<TorrentFile>]) -> Result<usize> {
        let mut total_write_count = 0;

        let mut blocks: Vec<_> = self.blocks.values().map(|b| IoVec::from_slice(b)).collect();
        let mut bufs = blocks.as_mut_slice();
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.file_range.clone()];
        debug_assert!(!files.is_empty());

        if files.len() == 1 {
            let file = files[0].read().unwrap();
            let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(bufs);
            total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.read().unwrap();
                let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());

                let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
                let write_count = file.write_vectored_at(&mut iovecs, slice.offset)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());
        Ok(total_write_count)
    }
}

/// Reads an entire piece's worth of bytes off disk, split into the 16 KiB
/// blocks peers expect, for insertion into the read cache. Performs
/// synchronous IO; must be called off the async executor.
pub(crate) fn read(
    piece_torrent_offset: u64,
    file_range: Range<FileIndex>,
    files: &[RwLock<TorrentFile>],
    piece_len: u32,
) -> Result<Vec<CachedBlock>> {
    let mut buf = vec![0u8; piece_len as usize];
    let files = &files[file_range];
    debug_assert!(!files.is_empty());

    let mut torrent_offset = piece_torrent_offset;
    let mut buf_offset = 0usize;
    for file in files.iter() {
        let file = file.read().unwrap();
        let slice = file.info.get_slice(torrent_offset, piece_len as u64 - buf_offset as u64);
        let len = slice.len as usize;
        file.read_at(&mut buf[buf_offset..buf_offset + len], slice.offset)?;
        buf_offset += len;
        torrent_offset += len as u64;
    }
    debug_assert_eq!(buf_offset, piece_len as usize);

    Ok(buf
        .chunks(crate::BLOCK_LEN as usize)
        .map(|c| Arc::new(c.to_vec()))
        .collect())
}
