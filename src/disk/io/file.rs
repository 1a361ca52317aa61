//! A single file on disk that makes up part (or all) of a torrent's
//! contents, together with the vectored IO helpers used to read and write
//! it at arbitrary torrent-relative offsets.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;

use nix::sys::uio::{pread, pwritev};

use crate::disk::error::*;
use crate::iovecs::IoVecs;
use crate::storage_info::FileInfo;

/// An open file handle paired with the torrent-relative metadata needed to
/// translate torrent offsets into file-local ones.
pub(crate) struct TorrentFile {
    pub info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Opens (creating if necessary) the file at `dir.join(info.path)` and
    /// sparsely allocates it to its full length by extending the file with
    /// `set_len`, which on all major filesystems creates a hole rather than
    /// writing zeroes (spec.md §4.3: files are allocated up front, sparsely,
    /// so later pwritev calls never need to extend the file).
    pub fn new(dir: &std::path::Path, mut info: FileInfo) -> Result<Self> {
        let path = dir.join(&info.path);
        info.path = path.clone();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                log::info!("Creating torrent subdir {:?}", parent);
                fs::create_dir_all(parent)?;
            }
        }

        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        handle.set_len(info.len)?;

        Ok(Self { info, handle })
    }

    /// Writes `iovecs` at `offset` (torrent-file-relative), looping until
    /// every buffer has been confirmed written, since `pwritev` isn't
    /// guaranteed to consume the whole input in one syscall.
    pub fn write_vectored_at(&self, iovecs: &mut IoVecs<'_>, offset: u64) -> Result<usize> {
        let mut total = 0;
        while !iovecs.buffers().is_empty() {
            let write_count = pwritev(self.handle.as_raw_fd(), iovecs.buffers(), offset as i64)
                .map_err(|e| {
                    log::warn!("File {:?} write error: {}", self.info.path, e);
                    Error::Io(IoError::Other(std::io::Error::last_os_error()))
                })?;
            iovecs.advance(write_count);
            total += write_count;
        }
        Ok(total)
    }

    /// Reads exactly `buf.len()` bytes at `offset`, returning an error if
    /// the file doesn't yet contain that many bytes at that position (which
    /// signals the expected data hasn't been downloaded yet).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut read_total = 0;
        while read_total < buf.len() {
            let n = pread(
                self.handle.as_raw_fd(),
                &mut buf[read_total..],
                offset as i64 + read_total as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} read error: {}", self.info.path, e);
                Error::Io(IoError::Seek(std::io::Error::last_os_error()))
            })?;
            if n == 0 {
                return Err(Error::Io(IoError::ShortTransfer {
                    expected: buf.len(),
                    actual: read_total,
                }));
            }
            read_total += n;
        }
        Ok(())
    }
}
