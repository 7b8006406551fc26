//! Sequential batch processing of downloads and deletes.
//!
//! The backlog is an explicit stack: the last target added is processed
//! first, one at a time, with a settle pause between consecutive items so
//! the bridge's UART queues drain. A failing item is recorded and skipped;
//! the rest of the backlog still runs. Losing the transport aborts the
//! remainder, since every following item would only time out.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::SdRemote;
use crate::codec::Command;
use crate::error::Error;
use crate::event::Event;

/// Pause between consecutive batch items.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// One file to download: the remote path and the local destination.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub remote: String,
    pub dest: PathBuf,
}

/// Per-item outcome of a batch run.
#[derive(Debug)]
pub struct ItemOutcome {
    pub target: String,
    /// `None` on success, otherwise why the item failed.
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened to a whole backlog.
///
/// After a delete batch the caller should refresh its directory listing;
/// after a download batch it should clear any per-item selection state.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
    /// True when the transport dropped and the remaining targets were
    /// never attempted.
    pub aborted: bool,
}

impl BatchReport {
    pub fn all_ok(&self) -> bool {
        !self.aborted && self.items.iter().all(ItemOutcome::is_ok)
    }

    fn record_ok(&mut self, target: String) {
        self.items.push(ItemOutcome {
            target,
            error: None,
        });
    }

    fn record_err(&mut self, target: String, error: impl ToString) {
        self.items.push(ItemOutcome {
            target,
            error: Some(error.to_string()),
        });
    }
}

/// Drives a backlog of deletes, last added first.
pub async fn run_deletes(
    remote: &SdRemote,
    events: &mut mpsc::Receiver<Event>,
    mut backlog: Vec<String>,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut first = true;

    while let Some(path) = backlog.pop() {
        if !std::mem::take(&mut first) {
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        info!(path = %path, "deleting");
        if let Err(e) = remote.delete(&path).await {
            warn!(path = %path, error = %e, "delete not issued");
            report.record_err(path, e);
            continue;
        }
        match await_terminal(events, Command::Delete).await {
            Terminal::Ok => report.record_ok(path),
            Terminal::Failed(message) => report.record_err(path, message),
            Terminal::Disconnected => {
                report.record_err(path, Error::NotConnected);
                report.aborted = !backlog.is_empty();
                break;
            }
        }
    }
    report
}

/// Drives a backlog of downloads, last added first.
pub async fn run_downloads(
    remote: &SdRemote,
    events: &mut mpsc::Receiver<Event>,
    mut backlog: Vec<DownloadTarget>,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut first = true;

    while let Some(target) = backlog.pop() {
        if !std::mem::take(&mut first) {
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        info!(remote = %target.remote, dest = %target.dest.display(), "downloading");
        if let Err(e) = remote.download(&target.remote, &target.dest).await {
            warn!(remote = %target.remote, error = %e, "download not issued");
            report.record_err(target.remote, e);
            continue;
        }
        match await_terminal(events, Command::Get).await {
            Terminal::Ok => report.record_ok(target.remote),
            Terminal::Failed(message) => report.record_err(target.remote, message),
            Terminal::Disconnected => {
                report.record_err(target.remote, Error::NotConnected);
                report.aborted = !backlog.is_empty();
                break;
            }
        }
    }
    report
}

enum Terminal {
    Ok,
    Failed(String),
    Disconnected,
}

/// Waits for the terminal event of the current item, logging progress
/// along the way.
async fn await_terminal(events: &mut mpsc::Receiver<Event>, command: Command) -> Terminal {
    loop {
        match events.recv().await {
            Some(Event::DeleteDone { .. }) if command == Command::Delete => return Terminal::Ok,
            Some(Event::DownloadDone { .. }) if command == Command::Get => return Terminal::Ok,
            Some(Event::CommandFailed { command: c, message }) if c == command => {
                return Terminal::Failed(message);
            }
            Some(Event::Disconnected) | None => return Terminal::Disconnected,
            Some(Event::DownloadProgress { received, declared }) => {
                debug!(received, declared, "batch item progress");
            }
            Some(other) => debug!(?other, "ignoring event during batch"),
        }
    }
}
