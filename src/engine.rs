//! The multi-torrent engine (spec.md §4.8, §6): owns the disk actor, the
//! process-wide incoming-connection listener, and the registry of per-torrent
//! actors, and exposes the control-surface API the embedding application
//! drives (initFromFile/initFromData/initFromSavedHash/start/stop/close/
//! recheck/setFilePriority/setFileDoNotDownload/setSpeedLimit/setSpeedMode/
//! changeListeningPort/disablePex/getStats/getFileStats/getPeerStats/
//! getPieceAvailability).
//!
//! Each `TorrentEngine` entry in spec.md §4.8 maps to one `torrent::Torrent`
//! actor here, spawned on its own task; this module is the registry and
//! process-wide resources (disk, listener) those actors share.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;

use crate::conf::{Conf, TorrentConf};
use crate::disk::{self, Disk};
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer_manager::PeerSnapshot;
use crate::rate_limiter::{GlobalRateLimiter, Mode as RateMode};
use crate::resume::ResumeData;
use crate::storage_info::{FileInfo, StorageInfo};
use crate::torrent::{self, Stats, Torrent, TorrentEntryParams};
use crate::{FileIndex, Priority, TorrentId};

/// Parameters for adding a new torrent (spec.md §6: initFromData and the
/// data `initFromFile` builds before delegating to it).
pub struct TorrentParams {
    pub metainfo: Metainfo,
    pub download_dir: PathBuf,
    /// Overrides the engine's default per-torrent configuration.
    pub conf: Option<TorrentConf>,
    /// Overrides the engine's default PEX setting. Ignored (forced off) for
    /// private torrents regardless of this value (spec.md §4.5).
    pub pex_enabled: Option<bool>,
}

/// Per-file download progress, as returned by `Engine::get_file_stats`
/// (spec.md §6: getFileStats).
#[derive(Clone, Debug)]
pub struct FileStats {
    pub info: FileInfo,
    pub downloaded: u64,
}

/// Per-peer transfer snapshot, as returned by `Engine::get_peer_stats`
/// (spec.md §6: getPeerStats).
#[derive(Clone, Debug)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub peer_id: Option<crate::PeerId>,
    pub is_unchoked: bool,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl From<PeerSnapshot> for PeerStats {
    fn from(s: PeerSnapshot) -> Self {
        Self {
            addr: s.addr,
            peer_id: s.peer_id,
            is_unchoked: s.is_unchoked,
            download_rate: s.download_rate,
            upload_rate: s.upload_rate,
            downloaded: s.downloaded,
            uploaded: s.uploaded,
        }
    }
}

/// Which transfer direction a speed limit or mode applies to (spec.md §6:
/// setSpeedLimit, setSpeedMode).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Public counterpart of `rate_limiter::Mode`, kept separate so that module
/// stays crate-private (spec.md §4.7 describes the policy, not a wire type).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedMode {
    /// Follow only the engine-wide global bucket.
    Global,
    /// Follow only this torrent's own bucket.
    Single,
    /// No limiting at all.
    Unlimited,
}

impl From<SpeedMode> for RateMode {
    fn from(m: SpeedMode) -> Self {
        match m {
            SpeedMode::Global => RateMode::Global,
            SpeedMode::Single => RateMode::Single,
            SpeedMode::Unlimited => RateMode::Unlimited,
        }
    }
}

struct TorrentEntry {
    cmd: torrent::CommandSender,
    info_hash: crate::Sha1Hash,
    alert_tx: mpsc::UnboundedSender<disk::Alert>,
}

/// The length of a BitTorrent handshake's info hash field, and its offset
/// (spec.md §4.5: 1 + 19 + 8 reserved bytes precede it).
const INFO_HASH_OFFSET: usize = 1 + 19 + 8;
const HANDSHAKE_LEN: usize = 68;

pub struct Engine {
    conf: Conf,
    disk_cmd: disk::CommandSender,
    global_rate_limiter: Arc<GlobalRateLimiter>,
    torrents: Arc<AsyncRwLock<HashMap<TorrentId, TorrentEntry>>>,
    next_id: AtomicU32,
    listen_addr: AsyncMutex<SocketAddr>,
    listener_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Constructs the engine and starts its disk actor, but does not yet
    /// bind the process-wide listening socket (see `start_listening`).
    pub fn new(conf: Conf) -> Self {
        let (mut disk, disk_cmd, mut alert_port) = Disk::new();
        tokio::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk actor terminated with error: {}", e);
            }
        });

        let torrents: Arc<AsyncRwLock<HashMap<TorrentId, TorrentEntry>>> =
            Arc::new(AsyncRwLock::new(HashMap::new()));
        let listen_addr = conf.engine.listen_addr;

        // The disk alert demultiplexer: each `Alert` carries the `TorrentId`
        // it belongs to; this is the only consumer of the disk's single
        // alert stream, forwarding to each torrent's own per-torrent alert
        // channel so `Torrent::start`'s select loop can keep treating disk
        // alerts as a private stream.
        let demux_torrents = Arc::clone(&torrents);
        tokio::spawn(async move {
            while let Some(alert) = alert_port.recv().await {
                Self::dispatch_alert(&demux_torrents, alert).await;
            }
        });

        Self {
            conf,
            disk_cmd,
            global_rate_limiter: GlobalRateLimiter::new(),
            torrents,
            next_id: AtomicU32::new(1),
            listen_addr: AsyncMutex::new(listen_addr),
            listener_handle: AsyncMutex::new(None),
        }
    }

    async fn dispatch_alert(
        torrents: &Arc<AsyncRwLock<HashMap<TorrentId, TorrentEntry>>>,
        alert: disk::Alert,
    ) {
        let id = match &alert {
            disk::Alert::TorrentAllocation { id, .. } => *id,
            disk::Alert::PieceCompletion { id, .. } => *id,
            disk::Alert::WriteError { id, .. } => *id,
            disk::Alert::ReadError { id, .. } => *id,
            disk::Alert::RecheckResult { id, .. } => *id,
        };
        let torrents = torrents.read().await;
        if let Some(entry) = torrents.get(&id) {
            if entry.alert_tx.send(alert).is_err() {
                log::warn!("Torrent {} alert channel closed", id);
            }
        } else {
            log::debug!("Dropping disk alert for unknown torrent {}", id);
        }
    }

    /// Binds the process-wide incoming-connection listener (spec.md §6,
    /// "Environment") and spawns the accept loop. Returns the actually bound
    /// address, useful when the configured port is 0.
    pub async fn start_listening(&self) -> Result<SocketAddr> {
        let addr = *self.listen_addr.lock().await;
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        *self.listen_addr.lock().await = bound_addr;

        let torrents = Arc::clone(&self.torrents);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        Self::route_incoming(Arc::clone(&torrents), socket, addr);
                    }
                    Err(e) => {
                        log::warn!("Accept failed on incoming listener: {}", e);
                    }
                }
            }
        });

        let mut prev = self.listener_handle.lock().await;
        if let Some(old) = prev.replace(handle) {
            old.abort();
        }

        log::info!("Listening for incoming peer connections on {}", bound_addr);
        Ok(bound_addr)
    }

    /// Peeks the handshake's info hash without consuming the socket's read
    /// buffer, then hands the still-unread connection to the matching
    /// torrent's `PeerManager` (spec.md §4.6: "incoming listener" intake
    /// source). The torrent itself performs the real handshake read.
    fn route_incoming(
        torrents: Arc<AsyncRwLock<HashMap<TorrentId, TorrentEntry>>>,
        socket: TcpStream,
        addr: SocketAddr,
    ) {
        tokio::spawn(async move {
            let mut buf = [0u8; HANDSHAKE_LEN];
            match socket.peek(&mut buf).await {
                Ok(n) if n == HANDSHAKE_LEN => {}
                Ok(_) => {
                    log::debug!("Incoming connection from {} closed before handshake", addr);
                    return;
                }
                Err(e) => {
                    log::debug!("Failed to peek handshake from {}: {}", addr, e);
                    return;
                }
            }
            let mut info_hash = [0u8; 20];
            info_hash.copy_from_slice(&buf[INFO_HASH_OFFSET..INFO_HASH_OFFSET + 20]);

            let torrents = torrents.read().await;
            let matched = torrents.values().find(|e| e.info_hash == info_hash);
            match matched {
                Some(entry) => {
                    let _ = entry.cmd.send(torrent::Command::AcceptIncoming(socket, addr));
                }
                None => {
                    log::debug!(
                        "Incoming connection from {} does not match any active torrent",
                        addr
                    );
                }
            }
        });
    }

    /// Reads and parses a metainfo file from disk, then delegates to
    /// `init_from_data` (spec.md §6: initFromFile).
    pub async fn init_from_file(
        &self,
        torrent_path: &Path,
        download_dir: PathBuf,
    ) -> Result<TorrentId> {
        let buf = tokio::fs::read(torrent_path).await?;
        let metainfo = Metainfo::from_bytes(&buf)?;
        self.init_from_data(TorrentParams {
            metainfo,
            download_dir,
            conf: None,
            pex_enabled: None,
        })
        .await
    }

    /// Registers and starts a new torrent actor (spec.md §6: initFromData).
    pub async fn init_from_data(&self, params: TorrentParams) -> Result<TorrentId> {
        let info_hash = params
            .metainfo
            .create_info_hash()
            .map_err(|e| Error::ParseError(e.to_string()))?;
        {
            let torrents = self.torrents.read().await;
            if torrents.values().any(|e| e.info_hash == info_hash) {
                return Err(Error::DuplicateTorrent);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let storage = StorageInfo::new(&params.metainfo, params.download_dir.clone());
        let piece_hashes = params.metainfo.info.pieces.clone();
        self.disk_cmd.send(disk::Command::NewTorrent {
            id,
            info: storage,
            piece_hashes,
        })?;

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let conf = params.conf.unwrap_or_else(|| self.conf.torrent.clone());
        let is_private = params.metainfo.is_private();
        let pex_enabled =
            !is_private && params.pex_enabled.unwrap_or(self.conf.engine.pex_enabled_by_default);
        let listen_port = self.listen_addr.lock().await.port();

        let entry_params = TorrentEntryParams {
            id,
            metainfo: params.metainfo,
            download_dir: params.download_dir,
            conf,
            client_id: self.conf.engine.client_id,
            listen_port,
            pex_enabled,
        };
        let (mut torrent, cmd_tx) = Torrent::new(
            entry_params,
            self.disk_cmd.clone(),
            alert_rx,
            Arc::clone(&self.global_rate_limiter),
        );
        tokio::spawn(async move {
            if let Err(e) = torrent.start().await {
                log::warn!("Torrent {} actor ended with error: {}", id, e);
            }
        });

        self.torrents.write().await.insert(
            id,
            TorrentEntry {
                cmd: cmd_tx,
                info_hash,
                alert_tx,
            },
        );
        Ok(id)
    }

    /// Registers a new torrent and immediately reconstructs its run state,
    /// per-file priority/DND, rate limits, and lifetime counters from a
    /// previously captured `ResumeData` (spec.md §6: initFromSavedHash).
    pub async fn init_from_saved_hash(
        &self,
        params: TorrentParams,
        resume: ResumeData,
    ) -> Result<TorrentId> {
        let id = self.init_from_data(params).await?;
        self.send_command(id, torrent::Command::ApplyResumeData(resume)).await?;
        Ok(id)
    }

    async fn send_command(&self, id: TorrentId, cmd: torrent::Command) -> Result<()> {
        let torrents = self.torrents.read().await;
        let entry = torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        entry.cmd.send(cmd)?;
        Ok(())
    }

    async fn query<T>(
        &self,
        id: TorrentId,
        build: impl FnOnce(oneshot::Sender<T>) -> torrent::Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(id, build(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn start(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::Start).await
    }

    pub async fn stop(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::Stop).await
    }

    /// Stops and removes a torrent's actor. Does not delete its files
    /// (spec.md §6: close).
    pub async fn close(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::Close).await?;
        self.torrents.write().await.remove(&id);
        self.disk_cmd.send(disk::Command::EjectTorrent { id })?;
        Ok(())
    }

    pub async fn recheck(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::Recheck).await
    }

    pub async fn set_file_priority(
        &self,
        id: TorrentId,
        file: FileIndex,
        priority: Priority,
    ) -> Result<()> {
        self.send_command(id, torrent::Command::SetFilePriority { file, priority })
            .await
    }

    pub async fn set_file_do_not_download(
        &self,
        id: TorrentId,
        file: FileIndex,
        dnd: bool,
    ) -> Result<()> {
        self.send_command(id, torrent::Command::SetFileDoNotDownload { file, dnd })
            .await
    }

    pub async fn set_speed_limit(
        &self,
        id: TorrentId,
        direction: Direction,
        limit: Option<u64>,
    ) -> Result<()> {
        let cmd = match direction {
            Direction::Download => torrent::Command::SetDownloadLimit(limit),
            Direction::Upload => torrent::Command::SetUploadLimit(limit),
        };
        self.send_command(id, cmd).await
    }

    /// Sets the engine-wide rate budget every torrent in `SpeedMode::Global`
    /// composes with its own per-torrent bucket (spec.md §4.7).
    pub fn set_global_speed_limit(&self, direction: Direction, limit: Option<u64>) {
        match direction {
            Direction::Download => self.global_rate_limiter.set_download_limit(limit),
            Direction::Upload => self.global_rate_limiter.set_upload_limit(limit),
        }
    }

    pub async fn set_speed_mode(
        &self,
        id: TorrentId,
        direction: Direction,
        mode: SpeedMode,
    ) -> Result<()> {
        let mode = RateMode::from(mode);
        let cmd = match direction {
            Direction::Download => torrent::Command::SetDownloadMode(mode),
            Direction::Upload => torrent::Command::SetUploadMode(mode),
        };
        self.send_command(id, cmd).await
    }

    /// Rebinds the process-wide listener to a new port and informs every
    /// active torrent so its LTEP handshake announces the new port (spec.md
    /// §6: changeListeningPort).
    pub async fn change_listening_port(&self, port: u16) -> Result<SocketAddr> {
        {
            let mut addr = self.listen_addr.lock().await;
            addr.set_port(port);
        }
        let bound = self.start_listening().await?;
        let ids: Vec<TorrentId> = self.torrents.read().await.keys().copied().collect();
        for id in ids {
            let _ = self
                .send_command(id, torrent::Command::ChangeListeningPort(bound.port()))
                .await;
        }
        Ok(bound)
    }

    pub async fn disable_pex(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::DisablePex).await
    }

    pub async fn get_stats(&self, id: TorrentId) -> Result<Stats> {
        self.query(id, torrent::Command::GetStats).await
    }

    pub async fn get_file_stats(&self, id: TorrentId) -> Result<Vec<FileStats>> {
        let entries = self.query(id, torrent::Command::GetFileStats).await??;
        Ok(entries
            .into_iter()
            .map(|(info, downloaded)| FileStats { info, downloaded })
            .collect())
    }

    pub async fn get_peer_stats(&self, id: TorrentId) -> Result<Vec<PeerStats>> {
        let snapshots = self.query(id, torrent::Command::GetPeerStats).await?;
        Ok(snapshots.into_iter().map(PeerStats::from).collect())
    }

    pub async fn get_piece_availability(&self, id: TorrentId) -> Result<Vec<u32>> {
        self.query(id, torrent::Command::GetPieceAvailability).await
    }

    /// Returns `Some(ResumeData)` only if state has changed since the last
    /// call (spec.md §4.8: `fastResumeDirty`); callers otherwise have
    /// nothing new worth persisting.
    pub async fn resume_data(&self, id: TorrentId) -> Result<Option<ResumeData>> {
        self.query(id, torrent::Command::GetResumeData).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_mode_conversion() {
        assert_eq!(RateMode::from(SpeedMode::Unlimited), RateMode::Unlimited);
        assert_eq!(RateMode::from(SpeedMode::Single), RateMode::Single);
        assert_eq!(RateMode::from(SpeedMode::Global), RateMode::Global);
    }
}
