//! Per-torrent disk state: the write buffer of in-progress pieces, open
//! file handles, and the read cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use tokio::task;

use crate::bitfield::Bitfield;
use crate::disk::error::*;
use crate::disk::io::file::TorrentFile;
use crate::disk::io::piece::{self, Piece};
use crate::disk::{Alert, AlertSender};
use crate::storage_info::{FsStructure, StorageInfo};
use crate::{Block, BlockInfo, CachedBlock, PieceIndex, Sha1Hash, TorrentId};

/// The read cache's capacity, in pieces. A piece is typically requested by
/// several consecutive blocks from the same peer, so caching the whole
/// piece after the first read avoids re-reading it from disk for every
/// subsequent block request (spec.md §4.3).
const READ_CACHE_CAPACITY: usize = 32;

/// Torrent information related to disk IO: the in-progress write buffer,
/// open file handles, and the read cache.
pub(crate) struct Torrent {
    id: TorrentId,
    info: StorageInfo,
    /// The channel `Disk` uses to alert the engine of disk events concerning
    /// this torrent.
    alert_chan: AlertSender,
    /// The in-progress piece downloads and disk writes, keyed by piece
    /// index.
    // TODO: currently unbounded; a production build would cap this to avoid
    // unbounded memory growth if disk falls behind the network.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Handles of all files in the torrent, opened (and sparsely allocated)
    /// in advance.
    files: Arc<Vec<RwLock<TorrentFile>>>,
    /// Caches whole pieces after they've been read from disk once, since a
    /// peer that requests one block of a piece usually requests the rest of
    /// it shortly after.
    read_cache: Mutex<LruCache<PieceIndex, Vec<CachedBlock>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    write_count: std::sync::atomic::AtomicU64,
    write_failure_count: std::sync::atomic::AtomicUsize,
    read_count: std::sync::atomic::AtomicU64,
    read_failure_count: std::sync::atomic::AtomicUsize,
}

impl Torrent {
    /// Creates the torrent's file system structure and opens (sparsely
    /// allocating) every file's handle.
    pub fn new(
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: AlertSender,
    ) -> Result<Self> {
        if !info.download_dir.is_dir() {
            log::warn!("Creating missing download directory {:?}", info.download_dir);
            std::fs::create_dir_all(&info.download_dir)?;
        }

        let files = match &info.structure {
            FsStructure::File(file) => {
                vec![RwLock::new(TorrentFile::new(&info.download_dir, file.clone())?)]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                let mut handles = Vec::with_capacity(files.len());
                for file in files {
                    handles.push(RwLock::new(TorrentFile::new(&info.download_dir, file.clone())?));
                }
                handles
            }
        };

        Ok(Self {
            id,
            info,
            alert_chan,
            write_buf: HashMap::new(),
            files: Arc::new(files),
            read_cache: Mutex::new(LruCache::new(READ_CACHE_CAPACITY)),
            piece_hashes,
            stats: Stats::default(),
        })
    }

    /// Enqueues `data` as the block at `info` in its piece's write buffer.
    /// If this completes the piece, hashes and (if valid) writes it to disk
    /// on a blocking thread, then alerts the engine of the result.
    pub async fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Torrent {} saving block {} to disk", self.id, info);

        let piece_index = info.piece_index;
        if !self.write_buf.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(piece_index) {
                self.alert_chan.send(Alert::WriteError {
                    id: self.id,
                    piece_index,
                    error: e,
                })?;
                return Ok(());
            }
        }
        let piece = self
            .write_buf
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");
        piece.enqueue_block(info.offset, data);

        if !piece.is_complete() {
            return Ok(());
        }

        let piece = self.write_buf.remove(&piece_index).unwrap();
        let torrent_piece_offset = self.info.torrent_piece_offset(piece_index);
        let files = Arc::clone(&self.files);
        let id = self.id;

        let result = task::spawn_blocking(move || {
            let is_valid = piece.matches_hash();
            if is_valid {
                piece.write(torrent_piece_offset, &files).map(Some)
            } else {
                Ok(None)
            }
        })
        .await
        .expect("disk write task panicked");

        match result {
            Ok(Some(write_count)) => {
                self.stats
                    .write_count
                    .fetch_add(write_count as u64, std::sync::atomic::Ordering::Relaxed);
                self.alert_chan.send(Alert::PieceCompletion {
                    id,
                    piece_index,
                    is_valid: true,
                })?;
            }
            Ok(None) => {
                self.alert_chan.send(Alert::PieceCompletion {
                    id,
                    piece_index,
                    is_valid: false,
                })?;
            }
            Err(e) => {
                self.stats
                    .write_failure_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.alert_chan.send(Alert::WriteError {
                    id,
                    piece_index,
                    error: e,
                })?;
            }
        }

        Ok(())
    }

    fn start_new_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        let expected_hash = self.expected_hash(piece_index)?;
        let len = self.info.piece_len(piece_index)?;
        let file_range = self.info.files_intersecting_piece(piece_index)?;
        self.write_buf.insert(
            piece_index,
            Piece {
                expected_hash,
                len,
                blocks: BTreeMap::new(),
                file_range,
            },
        );
        Ok(())
    }

    fn expected_hash(&self, piece_index: PieceIndex) -> Result<Sha1Hash> {
        let pos = piece_index * 20;
        if pos + 20 > self.piece_hashes.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        Ok(hash)
    }

    /// Returns the requested block, either from the read cache or by
    /// reading the whole piece off disk (and caching it for subsequent
    /// block requests in the same piece), sending it via `result_chan`.
    pub async fn read_block(&self, block_info: BlockInfo, result_chan: crate::peer::Sender) -> Result<()> {
        let piece_index = block_info.piece_index;
        let block_index = block_info.index_in_piece();

        if let Some(blocks) = self.read_cache.lock().unwrap().get(&piece_index) {
            let block = blocks
                .get(block_index)
                .cloned()
                .ok_or(Error::InvalidPieceIndex)?;
            result_chan
                .send(crate::peer::Command::Block(Block::new(block_info, block)))?;
            return Ok(());
        }

        let file_range = self.info.files_intersecting_piece(piece_index)?;
        let torrent_piece_offset = self.info.torrent_piece_offset(piece_index);
        let piece_len = self.info.piece_len(piece_index)?;
        let files = Arc::clone(&self.files);

        let result =
            task::spawn_blocking(move || piece::read(torrent_piece_offset, file_range, &files, piece_len))
                .await
                .expect("disk read task panicked");

        match result {
            Ok(blocks) => {
                self.stats
                    .read_count
                    .fetch_add(piece_len as u64, std::sync::atomic::Ordering::Relaxed);
                let block = blocks
                    .get(block_index)
                    .cloned()
                    .ok_or(Error::InvalidPieceIndex)?;
                self.read_cache.lock().unwrap().put(piece_index, blocks);
                result_chan
                    .send(crate::peer::Command::Block(Block::new(block_info, block)))?;
            }
            Err(e) => {
                self.stats
                    .read_failure_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.alert_chan.send(Alert::ReadError {
                    id: self.id,
                    block_info,
                    error: e,
                })?;
            }
        }

        Ok(())
    }

    /// Rereads and rehashes every piece already on disk, returning a
    /// bitfield of which pieces are valid. Used both for a fresh torrent
    /// resumed from a partially downloaded directory, and for an
    /// explicit user-triggered recheck (spec.md §4.8's `recheck`
    /// operation). Long running; the caller is expected to run this on a
    /// blocking thread and to serialize it against other torrents' checks.
    pub fn recheck(&self) -> Result<Bitfield> {
        let mut have = Bitfield::new(self.info.piece_count);
        for piece_index in 0..self.info.piece_count {
            let piece_len = self.info.piece_len(piece_index)?;
            let file_range = self.info.files_intersecting_piece(piece_index)?;
            let torrent_piece_offset = self.info.torrent_piece_offset(piece_index);
            let blocks = match piece::read(torrent_piece_offset, file_range, &self.files, piece_len) {
                Ok(blocks) => blocks,
                // missing/short file data means this piece isn't present yet
                Err(_) => continue,
            };
            let expected_hash = self.expected_hash(piece_index)?;
            let mut hasher = <sha1::Sha1 as sha1::Digest>::new();
            for block in &blocks {
                sha1::Digest::update(&mut hasher, block.as_slice());
            }
            let hash = sha1::Digest::finalize(hasher);
            if hash.as_slice() == expected_hash {
                have.set(piece_index);
            }
        }
        Ok(have)
    }
}
