//! Outcome events emitted by the protocol engine.

use std::path::PathBuf;

use crate::codec::{Command, FileInfo};
use crate::listing::FsNode;

/// Everything a caller can observe about the in-flight command.
///
/// Every accepted command produces exactly one terminal event: its success
/// variant or [`Event::CommandFailed`]. Progress events may precede the
/// terminal one for transfers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A LIST reply was decoded; nodes are already sorted.
    ListingReady(Vec<FsNode>),
    /// An INFO reply was decoded.
    InfoReady(FileInfo),
    /// The bridge confirmed a delete; `name` is the path it echoed back.
    DeleteDone { name: String },

    /// The GET size header arrived.
    DownloadStarted { declared: u64 },
    /// Cumulative bytes written for the active download.
    DownloadProgress { received: u64, declared: u64 },
    /// The download reached its declared size and the file is closed.
    DownloadDone { dest: PathBuf },

    /// The bridge accepted the upload request; streaming begins.
    UploadStarted { total: u64 },
    /// Cumulative bytes sent for the active upload.
    UploadProgress { sent: u64, total: u64 },
    /// The upload finished and the line has settled.
    UploadDone { source: PathBuf },

    /// Terminal failure of the in-flight command.
    CommandFailed { command: Command, message: String },
    /// The transport dropped; any in-flight command has been failed.
    Disconnected,
}
