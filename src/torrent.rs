//! The per-torrent actor: owns `Completion`, the `PiecePicker`, and the
//! `PeerManager`, and fans disk alerts and peer events into the state
//! transitions spec.md §4.8 describes (Stopped/Running/Stopping/Checking).
//!
//! `SharedStatus` is the non-owning handle peer sessions hold back to this
//! actor's state (spec.md §9: "a non-owning handle... exposing only the
//! callbacks the session needs").

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock};

use crate::bitfield::Bitfield;
use crate::completion::{self, Completion};
use crate::conf::TorrentConf;
use crate::counter::ThruputCounter;
use crate::disk;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer_manager::{self, Candidate, PeerManager};
use crate::piece_picker::PiecePicker;
use crate::rate_limiter::{GlobalRateLimiter, RateControl};
use crate::storage_info::StorageInfo;
use crate::{FileIndex, PeerId, PieceIndex, Priority, Sha1Hash, TorrentId};

/// The torrent-wide run state (spec.md §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunState {
    Stopped,
    Running,
    Stopping,
    Checking,
}

/// Snapshot returned by `getStats` (spec.md §6).
#[derive(Clone, Debug)]
pub struct Stats {
    pub state: &'static str,
    pub piece_count: usize,
    pub connected_peers: usize,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub percent_done: f32,
    pub percent_complete: f32,
}

/// The non-owning handle sessions and the peer manager use to reach shared
/// torrent state without seeing the actor's internals (spec.md §9).
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub is_private: bool,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
    pub piece_picker: AsyncRwLock<PiecePicker>,
    pub completion: AsyncMutex<Completion>,
    pub rate_limiter: AsyncRwLock<RateControl>,
    pub disk: disk::CommandSender,
    pub pex_enabled: AtomicBool,
    pub listen_port: AtomicU16,
    pub download_counter: AsyncMutex<ThruputCounter>,
    pub upload_counter: AsyncMutex<ThruputCounter>,
    /// Peer ids of currently handshaked sessions, checked at handshake time
    /// to reject a second connection to the same peer (spec.md §4.5,
    /// `ProtocolError::DuplicatePeer`).
    pub known_peer_ids: AsyncMutex<HashSet<PeerId>>,
    /// Peer ids banned for accumulating too many blamed verification
    /// failures (spec.md §4.5, §8 S3); consulted at handshake time so a
    /// banned peer can't simply reconnect.
    pub banned_peer_ids: AsyncMutex<HashSet<PeerId>>,
    /// Set whenever state that belongs in the resume file changes; cleared
    /// by `Command::GetResumeData` (spec.md §4.8: `fastResumeDirty`).
    pub resume_dirty: AtomicBool,
}

impl SharedStatus {
    /// Re-evaluates and records the DND flag for every piece that belongs to
    /// `file` (used by `setFileDoNotDownload`).
    async fn set_file_dnd(&self, file: FileIndex, dnd: bool) -> Result<()> {
        let file_info = match &self.storage.structure {
            crate::storage_info::FsStructure::File(f) => {
                if file != 0 {
                    return Err(Error::InvalidPieceIndex);
                }
                f.clone()
            }
            crate::storage_info::FsStructure::Archive { files } => {
                files.get(file).cloned().ok_or(Error::InvalidPieceIndex)?
            }
        };
        let first_piece = (file_info.torrent_offset / self.storage.piece_len as u64) as usize;
        let last_piece = ((file_info.torrent_end_offset().saturating_sub(1))
            / self.storage.piece_len as u64) as usize;
        let mut completion = self.completion.lock().await;
        let mut picker = self.piece_picker.write().await;
        for piece in first_piece..=last_piece.min(self.storage.piece_count.saturating_sub(1)) {
            completion.set_dnd(piece, dnd);
            picker.set_dnd(piece, dnd);
        }
        Ok(())
    }
}

/// Commands accepted by the per-torrent actor (spec.md §6's control surface,
/// minus the init* calls which construct the actor rather than message it).
pub(crate) enum Command {
    Start,
    Stop,
    Close,
    Recheck,
    SetFilePriority { file: FileIndex, priority: Priority },
    SetFileDoNotDownload { file: FileIndex, dnd: bool },
    SetDownloadLimit(Option<u64>),
    SetUploadLimit(Option<u64>),
    SetDownloadMode(crate::rate_limiter::Mode),
    SetUploadMode(crate::rate_limiter::Mode),
    ChangeListeningPort(u16),
    DisablePex,
    AddCandidates(Vec<Candidate>),
    /// An inbound connection the engine's process-wide listener routed here
    /// after peeking the handshake's info hash (spec.md §4.6: "incoming
    /// listener" intake source).
    AcceptIncoming(TcpStream, std::net::SocketAddr),
    GetStats(oneshot::Sender<Stats>),
    GetPieceAvailability(oneshot::Sender<Vec<u32>>),
    GetPeerStats(oneshot::Sender<Vec<crate::peer_manager::PeerSnapshot>>),
    GetFileStats(oneshot::Sender<Result<Vec<(crate::storage_info::FileInfo, u64)>>>),
    /// Replies `None` if nothing has changed since the last call (spec.md
    /// §4.8: `fastResumeDirty`), sparing the caller a write it doesn't need.
    GetResumeData(oneshot::Sender<Option<crate::resume::ResumeData>>),
    /// Reconstructs run state, per-file priority/DND, rate limits, and
    /// lifetime counters from a previously captured `ResumeData` (spec.md §6:
    /// initFromSavedHash).
    ApplyResumeData(crate::resume::ResumeData),
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Parameters needed to create a new torrent actor, mirroring the engine's
/// public `TorrentParams` (spec.md §6: initFromFile/initFromData).
pub(crate) struct TorrentEntryParams {
    pub id: TorrentId,
    pub metainfo: Metainfo,
    pub download_dir: PathBuf,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    pub listen_port: u16,
    pub pex_enabled: bool,
}

pub(crate) struct Torrent {
    shared: Arc<SharedStatus>,
    run_state: RunState,
    peers: PeerManager,
    peer_events: peer_manager::EventReceiver,
    disk_alerts: disk::AlertReceiver,
    cmd_port: CommandReceiver,
}

impl Torrent {
    pub fn new(
        params: TorrentEntryParams,
        disk_cmd: disk::CommandSender,
        disk_alerts: disk::AlertReceiver,
        global_rate_limiter: Arc<GlobalRateLimiter>,
    ) -> (Self, CommandSender) {
        let storage = StorageInfo::new(&params.metainfo, params.download_dir);
        let piece_picker = PiecePicker::new(&storage);
        let piece_lens: Vec<u32> = (0..storage.piece_count)
            .map(|p| storage.piece_len(p).expect("piece index in range"))
            .collect();
        let completion = Completion::new(&piece_lens, vec![false; storage.piece_count]);
        let is_private = params.metainfo.is_private();

        let shared = Arc::new(SharedStatus {
            id: params.id,
            info_hash: params
                .metainfo
                .create_info_hash()
                .unwrap_or([0; 20]),
            client_id: params.client_id,
            is_private,
            storage,
            conf: params.conf,
            piece_picker: AsyncRwLock::new(piece_picker),
            completion: AsyncMutex::new(completion),
            rate_limiter: AsyncRwLock::new(RateControl::new(global_rate_limiter)),
            disk: disk_cmd,
            pex_enabled: AtomicBool::new(params.pex_enabled && !is_private),
            listen_port: AtomicU16::new(params.listen_port),
            download_counter: AsyncMutex::new(ThruputCounter::new()),
            upload_counter: AsyncMutex::new(ThruputCounter::new()),
            known_peer_ids: AsyncMutex::new(HashSet::new()),
            banned_peer_ids: AsyncMutex::new(HashSet::new()),
            resume_dirty: AtomicBool::new(false),
        });

        let (peers, peer_events) = PeerManager::new(Arc::clone(&shared));
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

        (
            Self {
                shared,
                run_state: RunState::Stopped,
                peers,
                peer_events,
                disk_alerts,
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Runs the torrent actor until `Command::Close` or its command channel
    /// closes (spec.md §4.8, §5).
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {} actor", self.shared.id);
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut choke_tick = tokio::time::interval(self.shared.conf.choke_interval);
        let mut optimistic_tick =
            tokio::time::interval(self.shared.conf.optimistic_unchoke_interval);

        loop {
            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Close) | None => {
                            log::info!("Closing torrent {}", self.shared.id);
                            self.run_state = RunState::Stopping;
                            self.peers.shutdown_all();
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await?,
                    }
                }
                alert = self.disk_alerts.recv() => {
                    match alert {
                        Some(alert) => self.handle_disk_alert(alert).await?,
                        None => {
                            log::warn!("Torrent {} disk alert channel closed", self.shared.id);
                            break;
                        }
                    }
                }
                event = self.peer_events.recv() => {
                    if let Some(event) = event {
                        self.peers.handle_event(event).await;
                    }
                }
                _ = tick.tick() => {
                    self.peers.fill_peer_slots().await;
                }
                _ = choke_tick.tick() => {
                    self.peers.rechoke().await;
                }
                _ = optimistic_tick.tick() => {
                    self.peers.optimistic_unchoke().await;
                }
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Start => {
                if self.run_state == RunState::Stopped {
                    log::info!("Torrent {} starting", self.shared.id);
                    self.run_state = RunState::Running;
                }
            }
            Command::Stop => {
                log::info!("Torrent {} stopping", self.shared.id);
                self.run_state = RunState::Stopping;
                self.peers.shutdown_all();
                self.run_state = RunState::Stopped;
            }
            Command::Close => unreachable!("handled in start()'s select loop"),
            Command::Recheck => {
                self.run_state = RunState::Checking;
                self.shared
                    .disk
                    .send(disk::Command::RecheckTorrent { id: self.shared.id })?;
            }
            Command::SetFilePriority { file, priority } => {
                self.set_file_priority(file, priority).await?;
                self.shared.resume_dirty.store(true, Ordering::Relaxed);
            }
            Command::SetFileDoNotDownload { file, dnd } => {
                self.shared.set_file_dnd(file, dnd).await?;
                self.shared.resume_dirty.store(true, Ordering::Relaxed);
            }
            Command::SetDownloadLimit(limit) => {
                self.shared
                    .rate_limiter
                    .write()
                    .await
                    .set_torrent_download_limit(limit);
                self.shared.resume_dirty.store(true, Ordering::Relaxed);
            }
            Command::SetUploadLimit(limit) => {
                self.shared
                    .rate_limiter
                    .write()
                    .await
                    .set_torrent_upload_limit(limit);
                self.shared.resume_dirty.store(true, Ordering::Relaxed);
            }
            Command::SetDownloadMode(mode) => {
                self.shared.rate_limiter.write().await.set_download_mode(mode);
            }
            Command::SetUploadMode(mode) => {
                self.shared.rate_limiter.write().await.set_upload_mode(mode);
            }
            Command::ChangeListeningPort(port) => {
                self.shared.listen_port.store(port, Ordering::Relaxed);
            }
            Command::DisablePex => {
                self.shared.pex_enabled.store(false, Ordering::Relaxed);
            }
            Command::AddCandidates(candidates) => {
                self.peers.add_candidates(candidates);
            }
            Command::AcceptIncoming(socket, addr) => {
                self.peers.accept_incoming(socket, addr);
            }
            Command::GetStats(chan) => {
                let stats = self.collect_stats().await;
                let _ = chan.send(stats);
            }
            Command::GetPieceAvailability(chan) => {
                let picker = self.shared.piece_picker.read().await;
                let _ = chan.send(picker.availability_snapshot());
            }
            Command::GetPeerStats(chan) => {
                let _ = chan.send(self.peers.peer_snapshot());
            }
            Command::GetFileStats(chan) => {
                let _ = chan.send(self.collect_file_stats().await);
            }
            Command::GetResumeData(chan) => {
                let was_dirty = self.shared.resume_dirty.swap(false, Ordering::Relaxed);
                let resume = if was_dirty {
                    Some(self.collect_resume_data().await)
                } else {
                    None
                };
                let _ = chan.send(resume);
            }
            Command::ApplyResumeData(resume) => {
                self.apply_resume_data(resume).await?;
            }
        }
        Ok(())
    }

    async fn apply_resume_data(&mut self, resume: crate::resume::ResumeData) -> Result<()> {
        let bitfield = Bitfield::from_wire_bytes(&resume.verified_pieces, resume.piece_count)?;
        {
            let mut completion = self.shared.completion.lock().await;
            for piece in bitfield.iter_ones() {
                completion.mark_piece_verified(piece);
            }
            let _ = completion.status_transition();
        }
        for (file, priority) in resume.file_priorities {
            self.set_file_priority(file, priority).await?;
        }
        for (file, dnd) in resume.file_dnd {
            self.shared.set_file_dnd(file, dnd).await?;
        }
        {
            let mut rate_limiter = self.shared.rate_limiter.write().await;
            rate_limiter.set_torrent_download_limit(resume.download_limit);
            rate_limiter.set_torrent_upload_limit(resume.upload_limit);
        }
        if resume.downloaded > 0 {
            self.shared.download_counter.lock().await.add(resume.downloaded);
        }
        if resume.uploaded > 0 {
            self.shared.upload_counter.lock().await.add(resume.uploaded);
        }
        if resume.run_state == crate::resume::RunStateTag::Running {
            self.run_state = RunState::Running;
        }
        Ok(())
    }

    /// Returns, for each file, its `FileInfo` paired with the number of
    /// downloaded bytes attributable to it, by summing the byte overlap of
    /// every verified piece that intersects it (spec.md §6: getFileStats).
    async fn collect_file_stats(&self) -> Result<Vec<(crate::storage_info::FileInfo, u64)>> {
        let completion = self.shared.completion.lock().await;
        let storage = &self.shared.storage;
        let mut out = Vec::with_capacity(storage.file_count());
        for file in 0..storage.file_count() {
            let file_info = storage.file_info(file).ok_or(Error::InvalidPieceIndex)?;
            let piece_range = storage.file_piece_range(file)?;
            let mut downloaded = 0u64;
            for piece in piece_range {
                if !completion.piece_is_complete(piece) {
                    continue;
                }
                let piece_start = storage.torrent_piece_offset(piece);
                let piece_end = piece_start + storage.piece_len(piece)? as u64;
                let overlap_start = piece_start.max(file_info.torrent_offset);
                let overlap_end = piece_end.min(file_info.torrent_end_offset());
                if overlap_end > overlap_start {
                    downloaded += overlap_end - overlap_start;
                }
            }
            out.push((file_info.clone(), downloaded));
        }
        Ok(out)
    }

    /// Builds the logical resume field set for the current state (spec.md
    /// §6: "Persisted state").
    async fn collect_resume_data(&self) -> crate::resume::ResumeData {
        let completion = self.shared.completion.lock().await;
        let picker = self.shared.piece_picker.read().await;
        let rate_limiter = self.shared.rate_limiter.read().await;
        let download_counter = self.shared.download_counter.lock().await;
        let upload_counter = self.shared.upload_counter.lock().await;
        let storage = &self.shared.storage;

        let mut file_priorities = Vec::with_capacity(storage.file_count());
        let mut file_dnd = Vec::with_capacity(storage.file_count());
        for file in 0..storage.file_count() {
            if let Ok(mut pieces) = storage.file_piece_range(file) {
                let first = pieces.next().unwrap_or(0);
                file_priorities.push((file, picker.priority(first)));
                file_dnd.push((file, completion.is_dnd(first)));
            }
        }

        crate::resume::ResumeData {
            run_state: match self.run_state {
                RunState::Running => crate::resume::RunStateTag::Running,
                _ => crate::resume::RunStateTag::Stopped,
            },
            verified_pieces: completion.piece_bitfield().byte_view().to_vec(),
            piece_count: storage.piece_count,
            file_priorities,
            file_dnd,
            download_limit: rate_limiter.torrent_download_limit(),
            upload_limit: rate_limiter.torrent_upload_limit(),
            downloaded: download_counter.total(),
            uploaded: upload_counter.total(),
            download_dir: storage.download_dir.clone(),
        }
    }

    async fn set_file_priority(&self, file: FileIndex, priority: Priority) -> Result<()> {
        let file_info = match &self.shared.storage.structure {
            crate::storage_info::FsStructure::File(f) => {
                if file != 0 {
                    return Err(Error::InvalidPieceIndex);
                }
                f.clone()
            }
            crate::storage_info::FsStructure::Archive { files } => {
                files.get(file).cloned().ok_or(Error::InvalidPieceIndex)?
            }
        };
        let first_piece =
            (file_info.torrent_offset / self.shared.storage.piece_len as u64) as usize;
        let last_piece = ((file_info.torrent_end_offset().saturating_sub(1))
            / self.shared.storage.piece_len as u64) as usize;
        let mut picker = self.shared.piece_picker.write().await;
        for piece in first_piece..=last_piece.min(self.shared.storage.piece_count.saturating_sub(1))
        {
            picker.set_priority(piece, priority);
        }
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: disk::Alert) -> Result<()> {
        match alert {
            disk::Alert::TorrentAllocation { result, .. } => {
                if let Err(e) = result {
                    log::error!("Torrent {} allocation failed: {}", self.shared.id, e);
                }
            }
            disk::Alert::PieceCompletion {
                piece_index,
                is_valid,
                ..
            } => {
                self.handle_piece_completion(piece_index, is_valid).await?;
            }
            disk::Alert::WriteError { piece_index, error, .. } => {
                log::warn!(
                    "Torrent {} write error on piece {}: {}",
                    self.shared.id,
                    piece_index,
                    error
                );
            }
            disk::Alert::ReadError { block_info, error, .. } => {
                log::warn!(
                    "Torrent {} read error on block {}: {}",
                    self.shared.id,
                    block_info,
                    error
                );
            }
            disk::Alert::RecheckResult { result, .. } => {
                self.run_state = RunState::Running;
                match result {
                    Ok(have) => {
                        let mut completion = self.shared.completion.lock().await;
                        for piece in have.iter_ones() {
                            completion.mark_piece_verified(piece);
                        }
                        let _ = completion.status_transition();
                    }
                    Err(e) => log::error!("Torrent {} recheck failed: {}", self.shared.id, e),
                }
            }
        }
        Ok(())
    }

    /// Implements the block-commit step 5 of spec.md §4.5: on verify
    /// success, broadcast HAVE; on failure, clear the piece and assess ban
    /// points against every peer whose blame bitfield names it.
    async fn handle_piece_completion(&mut self, piece_index: PieceIndex, is_valid: bool) -> Result<()> {
        let mut completion = self.shared.completion.lock().await;
        if is_valid {
            completion.mark_piece_verified(piece_index);
            let (_, transition) = completion.status_transition();
            drop(completion);
            self.shared.resume_dirty.store(true, Ordering::Relaxed);
            self.peers.broadcast_have(piece_index).await;
            if let Some(status) = transition {
                log::info!("Torrent {} status transition: {:?}", self.shared.id, status);
            }
        } else {
            completion.clear_piece(piece_index);
            drop(completion);
            log::warn!(
                "Torrent {} piece {} failed verification, assessing blame",
                self.shared.id,
                piece_index
            );
            self.peers.assess_blame(piece_index).await;
        }
        Ok(())
    }

    async fn collect_stats(&self) -> Stats {
        let completion = self.shared.completion.lock().await;
        let download_counter = self.shared.download_counter.lock().await;
        let upload_counter = self.shared.upload_counter.lock().await;
        Stats {
            state: match self.run_state {
                RunState::Stopped => "stopped",
                RunState::Running => "running",
                RunState::Stopping => "stopping",
                RunState::Checking => "checking",
            },
            piece_count: self.shared.storage.piece_count,
            connected_peers: self.peers.connected_count(),
            download_rate: download_counter.rate(),
            upload_rate: upload_counter.rate(),
            downloaded: download_counter.total(),
            uploaded: upload_counter.total(),
            percent_done: completion.percent_done(),
            percent_complete: completion.percent_complete(),
        }
    }
}

pub(crate) use completion::Status as CompletionStatus;
