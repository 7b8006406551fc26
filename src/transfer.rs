//! File-transfer session state: one active download or upload.
//!
//! A session owns its local file handle exclusively and releases it when
//! the transfer reaches a terminal state. Byte counters are the source of
//! truth for completion: a download is done exactly when the received
//! count reaches the size declared in the GET header.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Error;

/// Upload sources are read in slices of this many bytes; each slice goes
/// out as one paced chunked write.
pub const READ_SLICE: usize = 512;

/// State for one file download in progress.
#[derive(Debug)]
pub struct DownloadSession {
    dest: PathBuf,
    file: Option<File>,
    declared: u64,
    received: u64,
}

impl DownloadSession {
    /// Prepares the destination: an existing file is removed and a fresh
    /// one created for writing. Called before the GET request goes out so
    /// a local failure never costs wire traffic.
    pub fn open(dest: &Path) -> Result<Self, Error> {
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        let file = File::create(dest)?;
        debug!(dest = %dest.display(), "download destination ready");
        Ok(Self {
            dest: dest.to_path_buf(),
            file: Some(file),
            declared: 0,
            received: 0,
        })
    }

    /// Records the size declared by the GET header.
    pub fn set_declared(&mut self, declared: u64) {
        self.declared = declared;
    }

    pub fn declared(&self) -> u64 {
        self.declared
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Writes one payload slice and returns the cumulative received count.
    ///
    /// Anything past the declared size is dropped rather than written, so
    /// the finished file is never longer than the header promised.
    pub fn write_slice(&mut self, slice: &[u8]) -> Result<u64, Error> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("destination handle already released")))?;

        let remaining = self.declared.saturating_sub(self.received) as usize;
        let take = slice.len().min(remaining);
        if take < slice.len() {
            warn!(
                extra = slice.len() - take,
                "dropping bytes past the declared size"
            );
        }
        file.write_all(&slice[..take])?;
        self.received += take as u64;
        Ok(self.received)
    }

    /// Whether every declared byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.received >= self.declared
    }

    /// Closes the handle after a successful transfer.
    pub fn finish(mut self) -> Result<PathBuf, Error> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(self.dest)
    }

    /// Best-effort release on failure; the partial file is left on disk.
    pub fn abort(&mut self) {
        self.file = None;
    }
}

/// State for one file upload in progress.
#[derive(Debug)]
pub struct UploadSession {
    source: PathBuf,
    file: File,
    total: u64,
    sent: u64,
}

impl UploadSession {
    /// Opens the source, which must exist and be a regular file.
    pub fn open(source: &Path) -> Result<Self, Error> {
        let meta = fs::metadata(source)?;
        if !meta.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", source.display()),
            )));
        }
        let file = File::open(source)?;
        Ok(Self {
            source: source.to_path_buf(),
            file,
            total: meta.len(),
            sent: 0,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Reads the next slice into `buf`, returning how many bytes it holds.
    /// A return shorter than `buf` (including 0) means end of file.
    pub fn read_slice(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.sent += filled as u64;
        Ok(filled)
    }
}
