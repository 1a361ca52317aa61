//! Decoding of the externally-provided metainfo structure (spec.md §6: the
//! bencode codec itself is out of scope, this module only consumes the
//! decoded fields).

use serde_bencode::Error;
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns true if the torrent is marked private, in which case PEX and
    /// DHT must stay disabled for it (spec.md §4.5).
    pub fn is_private(&self) -> bool {
        self.info.private.unwrap_or(0) != 0
    }

    /// Returns the number of pieces, derived from the concatenated SHA-1
    /// hash string length (spec.md §3: pieceCount = ceil(T/P), but since we
    /// have the authoritative hash list, deriving it from that is exact and
    /// avoids a separate derivation from total size).
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index * 20;
        let end = start + 20;
        if end > self.info.pieces.len() {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[start..end]);
        Some(hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// A per-piece download directive set by the embedding application via the
/// `setFilePriority`/`setFileDoNotDownload` control-surface calls (spec.md
/// §6, §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PieceAttributes {
    pub priority: crate::Priority,
    pub dnd: bool,
}

impl Default for PieceAttributes {
    fn default() -> Self {
        Self {
            priority: crate::Priority::Normal,
            dnd: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_count_and_hash() {
        let info = Info {
            name: "test".into(),
            pieces: vec![1u8; 40],
            piece_length: 16384,
            length: Some(32000),
            files: None,
            private: None,
        };
        let metainfo = Metainfo {
            info,
            announce: None,
            announce_list: None,
        };
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(0), Some([1u8; 20]));
        assert_eq!(metainfo.piece_hash(2), None);
        assert!(!metainfo.is_private());
    }
}
