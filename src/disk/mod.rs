//! The disk IO actor: owns every open file handle and the in-progress
//! write buffers for every torrent, and performs all blocking IO on a
//! thread pool so the network event loops are never blocked on it
//! (spec.md §4.3, §5).

mod error;
mod io;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::storage_info::StorageInfo;
use crate::{BlockInfo, PieceIndex, TorrentId};

use io::torrent::Torrent;

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// Commands sent to the disk task by the engine and torrent actors.
pub(crate) enum Command {
    /// Registers a new torrent, opening and sparsely allocating its files.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Queues a downloaded block for writing. Once its piece is complete,
    /// the piece is hashed and, if valid, flushed to disk.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block for sending to a peer, via the read cache where
    /// possible.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        result_chan: crate::peer::Sender,
    },
    /// Rereads and rehashes every piece already on disk for `id`. Serialized
    /// against every other torrent's recheck so that at most one torrent is
    /// hashing its whole contents at a time (spec.md §5).
    RecheckTorrent { id: TorrentId },
    /// Removes a torrent's bookkeeping. Does not delete files from disk.
    EjectTorrent { id: TorrentId },
    Shutdown,
}

/// Disk events sent back to the engine / torrent actors.
pub(crate) enum Alert {
    TorrentAllocation {
        id: TorrentId,
        result: Result<()>,
    },
    PieceCompletion {
        id: TorrentId,
        piece_index: PieceIndex,
        is_valid: bool,
    },
    WriteError {
        id: TorrentId,
        piece_index: PieceIndex,
        error: Error,
    },
    ReadError {
        id: TorrentId,
        block_info: BlockInfo,
        error: Error,
    },
    RecheckResult {
        id: TorrentId,
        result: Result<Bitfield>,
    },
}

/// Owns every torrent's disk state and processes `Command`s until
/// `Command::Shutdown` or the command channel closes.
pub(crate) struct Disk {
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
    /// Held while a torrent's full recheck is in progress, so that at most
    /// one torrent's contents are being rehashed at any given time, bounding
    /// peak CPU and IO load from concurrent full verifications.
    checking_mutex: Arc<AsyncMutex<()>>,
}

impl Disk {
    pub fn new() -> (Self, CommandSender, AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
                checking_mutex: Arc::new(AsyncMutex::new(())),
            },
            cmd_chan,
            alert_port,
        )
    }

    /// Runs the disk event loop until shutdown or the command channel
    /// closes.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                } => {
                    self.handle_new_torrent(id, info, piece_hashes)?;
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock {
                    id,
                    info,
                    result_chan,
                } => {
                    self.read_block(id, info, result_chan).await?;
                }
                Command::RecheckTorrent { id } => {
                    self.recheck_torrent(id).await?;
                }
                Command::EjectTorrent { id } => {
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_new_torrent(
        &mut self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            self.alert_chan.send(Alert::TorrentAllocation {
                id,
                result: Err(Error::DuplicateTorrent),
            })?;
            return Ok(());
        }

        match Torrent::new(id, info, piece_hashes, self.alert_chan.clone()) {
            Ok(torrent) => {
                self.torrents.insert(id, RwLock::new(torrent));
                self.alert_chan.send(Alert::TorrentAllocation {
                    id,
                    result: Ok(()),
                })?;
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                self.alert_chan.send(Alert::TorrentAllocation {
                    id,
                    result: Err(e),
                })?;
            }
        }
        Ok(())
    }

    async fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }

    async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        result_chan: crate::peer::Sender,
    ) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        torrent.read().await.read_block(info, result_chan).await
    }

    // TODO: `Torrent::recheck` performs blocking IO inline; move it onto
    // `task::spawn_blocking` once `Torrent` is wrapped in an `Arc` so it can
    // be moved into the blocking task independently of this read guard.
    async fn recheck_torrent(&self, id: TorrentId) -> Result<()> {
        let _permit = self.checking_mutex.lock().await;
        let result = match self.torrents.get(&id) {
            Some(torrent) => torrent.read().await.recheck(),
            None => Err(Error::InvalidTorrentId),
        };
        self.alert_chan.send(Alert::RecheckResult { id, result })?;
        Ok(())
    }
}
