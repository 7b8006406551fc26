//! Request encoding and reply decoding for the five bridge commands.
//!
//! Requests are short `@…#` text frames. Paths are slash-joined relative
//! paths; the card root is the empty path and is encoded as a bare
//! `@LIST#`.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::error::Error;

/// The command a request puts in flight. At most one may be outstanding;
/// it selects the reassembly rules for the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    Info,
    Delete,
    Get,
    Put,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::List => "LIST",
            Command::Info => "INFO",
            Command::Delete => "DELF",
            Command::Get => "GETF",
            Command::Put => "PUTF",
        };
        f.write_str(name)
    }
}

/// Metadata for a single remote file, as returned by INFO.
///
/// The timestamps are whatever text the bridge firmware prints; no date
/// parsing is attempted on this side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub created: String,
    pub modified: String,
}

pub fn encode_list(path: &str) -> Vec<u8> {
    if path.is_empty() {
        b"@LIST#".to_vec()
    } else {
        format!("@LIST:{path}#").into_bytes()
    }
}

pub fn encode_info(path: &str) -> Vec<u8> {
    format!("@INFO:{path}#").into_bytes()
}

pub fn encode_delete(path: &str) -> Vec<u8> {
    format!("@DELF:{path}#").into_bytes()
}

pub fn encode_get(path: &str) -> Vec<u8> {
    format!("@GETF:{path}#").into_bytes()
}

pub fn encode_put(path: &str, size: u64) -> Vec<u8> {
    format!("@PUTF:{path}%{size}#").into_bytes()
}

/// Joins a remote directory and an entry name the way the bridge expects.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

/// Decodes a completed INFO payload: `name%size%created%modified`.
///
/// An unparsable size degrades to 0; fewer than four fields makes the
/// reply unusable.
pub fn decode_info(payload: &[u8]) -> Result<FileInfo, Error> {
    let text = String::from_utf8_lossy(payload);
    let mut fields = text.split('%');
    let (Some(name), Some(size), Some(created), Some(modified)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::MalformedReply(format!("short INFO reply: {text}")));
    };

    let size = match size.parse::<u64>() {
        Ok(n) => n,
        Err(_) => {
            warn!(size, "unparsable file size in INFO reply, assuming 0");
            0
        }
    };

    Ok(FileInfo {
        name: name.to_owned(),
        size,
        created: created.to_owned(),
        modified: modified.to_owned(),
    })
}

/// Decodes a completed DELETE payload. Success is `OK%<name>`; anything
/// else means the bridge refused or failed the delete.
pub fn decode_delete(payload: &[u8]) -> Result<String, Error> {
    let text = String::from_utf8_lossy(payload);
    match text.strip_prefix("OK%") {
        Some(name) => Ok(name.to_owned()),
        None => Err(Error::Rejected(text.into_owned())),
    }
}
