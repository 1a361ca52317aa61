//! The logical field set for a torrent's persisted state (spec.md §6,
//! "Persisted state"). This crate only produces and consumes this field set;
//! the on-disk file format, location, and save cadence belong to the
//! embedding application (the fast-resume collaborator), the same boundary
//! `metainfo.rs` draws around the bencode codec itself.

use std::path::PathBuf;

use crate::{FileIndex, Priority};

/// The run state a torrent was in when its resume data was captured.
/// `Stopping`/`Checking` are transient and always collapse to `Stopped` when
/// captured, since there is nothing meaningful to resume into mid-transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStateTag {
    Stopped,
    Running,
}

/// Produced by `Engine::resume_data` and consumed by `Engine::init_from_saved_hash`
/// (spec.md §6: initFromSavedHash).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeData {
    pub run_state: RunStateTag,
    /// MSB-first byte view of the piece bitfield: bit `p` set means piece `p`
    /// has passed verification.
    pub verified_pieces: Vec<u8>,
    pub piece_count: usize,
    pub file_priorities: Vec<(FileIndex, Priority)>,
    pub file_dnd: Vec<(FileIndex, bool)>,
    pub download_limit: Option<u64>,
    pub upload_limit: Option<u64>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_dir: PathBuf,
}
