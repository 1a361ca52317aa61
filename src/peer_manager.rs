//! Owns the set of active `PeerSession`s for one torrent: candidate intake
//! and deduplication, the connection limit and FIFO waiting list, the
//! unchoke scheduler, HAVE broadcast, blame assessment after a failed
//! verification, and the periodic ut_pex `added`/`dropped` diff (spec.md
//! §4.6; PEX wire shape from `libtransmission/peer-msgs.c`, see
//! SPEC_FULL.md §B.1).

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::counter::ThruputCounter;
use crate::peer::{self, session::PeerSession};
use crate::torrent::SharedStatus;
use crate::{PeerId, PieceIndex};

/// Where a candidate peer address was learned from (spec.md §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CandidateSource {
    Tracker,
    Pex,
    Incoming,
    Resume,
}

#[derive(Clone, Debug)]
pub(crate) struct Candidate {
    pub addr: SocketAddr,
    pub source: CandidateSource,
}

/// A per-peer transfer snapshot, as returned by `PeerManager::peer_snapshot`.
#[derive(Clone, Debug)]
pub(crate) struct PeerSnapshot {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub is_unchoked: bool,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Reported by a session back to the manager as it disconnects or finishes
/// its handshake (spec.md §5's lock-free command queue, applied in reverse:
/// session → manager). Swarm availability is folded into the shared
/// `PiecePicker` by the session itself, since it already holds the peer's
/// bitfield; these events only maintain the manager's session table.
pub(crate) enum Event {
    HandshakeComplete {
        addr: SocketAddr,
        peer_id: PeerId,
    },
    Disconnected {
        addr: SocketAddr,
    },
    /// Reports bytes transferred since the session's last report, used to
    /// drive the unchoke ranking and the torrent-wide `getStats` counters.
    Progress {
        addr: SocketAddr,
        downloaded: u64,
        uploaded: u64,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<Event>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Event>;

struct Handle {
    sender: peer::Sender,
    peer_id: Option<PeerId>,
    is_unchoked: bool,
    connected_at: Instant,
    download: ThruputCounter,
    upload: ThruputCounter,
    /// Addresses already announced to this peer via ut_pex, so subsequent
    /// diffs only carry what changed since.
    pex_known: HashSet<SocketAddr>,
}

pub(crate) struct PeerManager {
    shared: Arc<SharedStatus>,
    sessions: HashMap<SocketAddr, Handle>,
    candidates: VecDeque<Candidate>,
    seen_addrs: HashSet<SocketAddr>,
    event_tx: EventSender,
}

/// Candidates beyond this connection count per torrent wait in the FIFO
/// queue (spec.md §4.6: "Connection limit per torrent ≈ 60").
const MAX_CONNECTIONS: usize = 60;
/// How many peers the unchoke scheduler keeps unchoked at once (spec.md
/// §4.6: "top K (typically 4)").
const UNCHOKE_SLOTS: usize = 4;
/// Peers connected within this long are weighted in the optimistic unchoke
/// draw (spec.md §4.6).
const NEW_PEER_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

impl PeerManager {
    pub fn new(shared: Arc<SharedStatus>) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared,
                sessions: HashMap::new(),
                candidates: VecDeque::new(),
                seen_addrs: HashSet::new(),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    /// Adds candidates, deduplicating by address against both currently
    /// connected peers and previously queued candidates (spec.md §4.6).
    pub fn add_candidates(&mut self, candidates: Vec<Candidate>) {
        for candidate in candidates {
            if self.sessions.contains_key(&candidate.addr) {
                continue;
            }
            if !self.seen_addrs.insert(candidate.addr) {
                continue;
            }
            self.candidates.push_back(candidate);
        }
    }

    /// Spawns outbound sessions for queued candidates up to the connection
    /// limit (spec.md §4.6).
    pub async fn fill_peer_slots(&mut self) {
        while self.sessions.len() < MAX_CONNECTIONS {
            let candidate = match self.candidates.pop_front() {
                Some(c) => c,
                None => break,
            };
            self.connect(candidate.addr);
        }
    }

    fn connect(&mut self, addr: SocketAddr) {
        log::info!("Torrent {} connecting to candidate peer {}", self.shared.id, addr);
        let (session, sender) = PeerSession::outbound(Arc::clone(&self.shared), addr, self.event_tx.clone());
        self.sessions.insert(
            addr,
            Handle {
                sender,
                peer_id: None,
                is_unchoked: false,
                connected_at: Instant::now(),
                download: ThruputCounter::new(),
                upload: ThruputCounter::new(),
                pex_known: HashSet::new(),
            },
        );
        tokio::spawn(async move {
            let mut session = session;
            if let Err(e) = session.start().await {
                log::warn!("Peer session {} ended with error: {}", addr, e);
            }
        });
    }

    /// Registers an already-accepted inbound connection (spec.md §4.6:
    /// "incoming listener" is one of the intake sources).
    pub fn accept_incoming(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.sessions.contains_key(&addr) {
            log::debug!("Dropping duplicate inbound connection from {}", addr);
            return;
        }
        let (session, sender) =
            PeerSession::inbound(Arc::clone(&self.shared), socket, addr, self.event_tx.clone());
        self.sessions.insert(
            addr,
            Handle {
                sender,
                peer_id: None,
                is_unchoked: false,
                connected_at: Instant::now(),
                download: ThruputCounter::new(),
                upload: ThruputCounter::new(),
                pex_known: HashSet::new(),
            },
        );
        tokio::spawn(async move {
            let mut session = session;
            if let Err(e) = session.start().await {
                log::warn!("Peer session {} ended with error: {}", addr, e);
            }
        });
    }

    /// Applies a session event: updates the session table (swarm
    /// availability is folded in by the session itself; see the `Event`
    /// doc comment).
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::HandshakeComplete { addr, peer_id } => {
                if let Some(handle) = self.sessions.get_mut(&addr) {
                    handle.peer_id = Some(peer_id);
                }
            }
            Event::Disconnected { addr } => {
                self.sessions.remove(&addr);
            }
            Event::Progress { addr, downloaded, uploaded } => {
                if downloaded > 0 {
                    self.shared.download_counter.lock().await.add(downloaded);
                }
                if uploaded > 0 {
                    self.shared.upload_counter.lock().await.add(uploaded);
                }
                if let Some(handle) = self.sessions.get_mut(&addr) {
                    handle.download.add(downloaded);
                    handle.upload.add(uploaded);
                }
            }
        }
    }

    /// Sends HAVE to every connected session (spec.md §4.5 step 5: "On
    /// verify success, broadcast HAVE to all sessions").
    pub async fn broadcast_have(&mut self, piece_index: PieceIndex) {
        let mut dead = Vec::new();
        for (addr, handle) in self.sessions.iter() {
            if handle.sender.send(peer::Command::Have(piece_index)).is_err() {
                dead.push(*addr);
            }
        }
        for addr in dead {
            self.sessions.remove(&addr);
        }
    }

    /// Asks every session to check whether its blame bitfield names
    /// `piece_index`, strike itself, and self-ban past the configured
    /// threshold (spec.md §4.5 step 5, §8 S3).
    pub async fn assess_blame(&mut self, piece_index: PieceIndex) {
        let mut dead = Vec::new();
        for (addr, handle) in self.sessions.iter() {
            if handle
                .sender
                .send(peer::Command::AssessBlame(piece_index))
                .is_err()
            {
                dead.push(*addr);
            }
        }
        for addr in dead {
            self.sessions.remove(&addr);
        }
    }

    /// Every `choke_interval`: unchoke the top `UNCHOKE_SLOTS` peers by
    /// recent transfer rate, choke the rest (spec.md §4.6). Also folds in
    /// the periodic ut_pex diff broadcast, since both are driven by the
    /// same cadence in this crate (SPEC_FULL.md §A.3's tunables don't call
    /// out a separate PEX interval).
    pub async fn rechoke(&mut self) {
        for handle in self.sessions.values_mut() {
            handle.download.end_round();
            handle.upload.end_round();
        }
        self.shared.download_counter.lock().await.end_round();
        self.shared.upload_counter.lock().await.end_round();

        // while leeching, rank by recent download rate from each peer; once
        // seeding (nothing left to fetch), by recent upload rate to them
        // instead (spec.md §4.6).
        let is_seeding = self.shared.completion.lock().await.left_until_done() == 0;
        let mut ranked: Vec<(SocketAddr, u64)> = self
            .sessions
            .iter()
            .map(|(addr, handle)| {
                let rate = if is_seeding { handle.upload.rate() } else { handle.download.rate() };
                (*addr, rate)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let unchoke_set: HashSet<SocketAddr> =
            ranked.into_iter().take(UNCHOKE_SLOTS).map(|(addr, _)| addr).collect();

        for (addr, handle) in self.sessions.iter_mut() {
            let should_unchoke = unchoke_set.contains(addr);
            if should_unchoke != handle.is_unchoked {
                handle.is_unchoked = should_unchoke;
                let _ = handle.sender.send(peer::Command::SetChoke(!should_unchoke));
            }
        }

        if self.shared.pex_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            self.broadcast_pex();
        }
    }

    /// Every `optimistic_unchoke_interval`: additionally unchoke one random
    /// choked peer, weighting peers newer than `NEW_PEER_WINDOW` by
    /// `optimistic_unchoke_new_peer_weight` (spec.md §4.6, §9 Open
    /// Question).
    pub async fn optimistic_unchoke(&mut self) {
        let weight = self.shared.conf.optimistic_unchoke_new_peer_weight.max(1);
        let now = Instant::now();
        let mut pool: Vec<SocketAddr> = Vec::new();
        for (addr, handle) in self.sessions.iter() {
            if handle.is_unchoked {
                continue;
            }
            let repeats = if now.duration_since(handle.connected_at) < NEW_PEER_WINDOW {
                weight
            } else {
                1
            };
            for _ in 0..repeats {
                pool.push(*addr);
            }
        }
        let chosen = pool.choose(&mut rand::thread_rng()).copied();
        if let Some(addr) = chosen {
            if let Some(handle) = self.sessions.get_mut(&addr) {
                handle.is_unchoked = true;
                let _ = handle.sender.send(peer::Command::SetChoke(false));
            }
        }
    }

    /// Builds and sends each connected (non-private-torrent) peer the set
    /// of addresses newly known/gone since the last exchange with them
    /// (spec.md §4.5's ut_pex paragraph).
    fn broadcast_pex(&mut self) {
        let all_addrs: HashSet<SocketAddr> = self.sessions.keys().copied().collect();
        for (addr, handle) in self.sessions.iter_mut() {
            let current_peers: HashSet<SocketAddr> =
                all_addrs.iter().filter(|a| *a != addr).copied().collect();
            let added: Vec<SocketAddr> =
                current_peers.difference(&handle.pex_known).copied().collect();
            let dropped: Vec<SocketAddr> =
                handle.pex_known.difference(&current_peers).copied().collect();
            if added.is_empty() && dropped.is_empty() {
                continue;
            }
            handle.pex_known = current_peers;
            let _ = handle.sender.send(peer::Command::SendPex {
                added: pack_endpoints(&added),
                dropped: pack_endpoints(&dropped),
            });
        }
    }

    /// A per-peer transfer snapshot for `getPeerStats` (spec.md §6).
    pub fn peer_snapshot(&self) -> Vec<PeerSnapshot> {
        self.sessions
            .iter()
            .map(|(addr, handle)| PeerSnapshot {
                addr: *addr,
                peer_id: handle.peer_id,
                is_unchoked: handle.is_unchoked,
                download_rate: handle.download.rate(),
                upload_rate: handle.upload.rate(),
                downloaded: handle.download.total(),
                uploaded: handle.upload.total(),
            })
            .collect()
    }

    /// Closes every session, e.g. on torrent stop/close (spec.md §4.8:
    /// "disconnect peers").
    pub fn shutdown_all(&mut self) {
        for handle in self.sessions.values() {
            let _ = handle.sender.send(peer::Command::Shutdown);
        }
        self.sessions.clear();
    }
}

/// Packs a list of IPv4 socket addresses into the 6-bytes-per-endpoint wire
/// format ut_pex uses (4 bytes big-endian address, 2 bytes big-endian port).
/// IPv6 peers are skipped, matching the original BEP 11 PEX payload shape.
fn pack_endpoints(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip() {
            let ip: Ipv4Addr = ip;
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_endpoints_roundtrip_shape() {
        let addrs = vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)), 51413),
        ];
        let packed = pack_endpoints(&addrs);
        assert_eq!(packed.len(), 12);
        assert_eq!(&packed[0..4], &[10, 0, 0, 1]);
        assert_eq!(&packed[4..6], &6881u16.to_be_bytes());
    }
}
