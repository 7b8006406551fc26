//! Reassembly of application frames from UART notification chunks.
//!
//! Replies arrive as arbitrarily split chunks of at most 20 bytes. How the
//! pieces are glued back together depends on the command that is waiting
//! for them: LIST frames are delimited by `@`/`#` at chunk edges, INFO and
//! DELETE scan for the markers anywhere in a chunk, GET switches to raw
//! binary after a `@<size>#` text header, and PUT only waits for one of
//! two literal handshake tokens.

use tracing::warn;

use crate::codec::Command;

/// Frame start marker.
pub const START: u8 = b'@';
/// Frame end marker.
pub const END: u8 = b'#';

/// Outcome of feeding one chunk to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// The frame is still incomplete, keep feeding.
    Incomplete,
    /// A delimited reply finished; markers are stripped.
    Complete(Vec<u8>),
    /// The GET size header finished. `payload` holds whatever followed the
    /// end marker in the same chunk, i.e. the first slice of the raw body.
    SizeHeader { declared: u64, payload: Vec<u8> },
    /// The remote accepted the upload request.
    UploadAccepted,
    /// The remote rejected the upload request.
    UploadRejected,
}

/// Accumulates chunks for the command currently in flight.
///
/// The buffer is owned by the protocol engine and must be [`reset`] when a
/// new command is issued; a completed frame clears it automatically.
///
/// [`reset`]: FrameAssembler::reset
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards any partial frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Feeds one inbound chunk, reassembling under the rules of `cmd`.
    ///
    /// GET payload bytes past the size header never go through here; once
    /// [`FrameEvent::SizeHeader`] is returned the engine routes chunks
    /// straight to the download session.
    pub fn feed(&mut self, cmd: Command, chunk: &[u8]) -> FrameEvent {
        if chunk.is_empty() {
            return FrameEvent::Incomplete;
        }
        match cmd {
            Command::List => self.feed_edge(chunk),
            Command::Info | Command::Delete => self.feed_scan(chunk),
            Command::Get => self.feed_size_header(chunk),
            Command::Put => self.feed_handshake(chunk),
        }
    }

    /// LIST framing: markers count only at the first/last byte of a chunk.
    fn feed_edge(&mut self, chunk: &[u8]) -> FrameEvent {
        let starts = chunk[0] == START;
        let ends = chunk[chunk.len() - 1] == END;

        if starts && ends && chunk.len() > 2 {
            // Self-contained message in a single chunk.
            self.buf.clear();
            return FrameEvent::Complete(chunk[1..chunk.len() - 1].to_vec());
        }
        if starts {
            // A new frame begins; any stale partial content is dropped.
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[1..]);
            return FrameEvent::Incomplete;
        }
        if ends {
            self.buf.extend_from_slice(&chunk[..chunk.len() - 1]);
            return FrameEvent::Complete(std::mem::take(&mut self.buf));
        }
        self.buf.extend_from_slice(chunk);
        FrameEvent::Incomplete
    }

    /// INFO/DELETE framing: markers are honoured anywhere in the chunk,
    /// because reassembly may begin with the reply already in progress.
    fn feed_scan(&mut self, chunk: &[u8]) -> FrameEvent {
        match chunk.iter().position(|&b| b == START) {
            Some(at) => {
                self.buf.clear();
                self.buf.extend_from_slice(&chunk[at + 1..]);
            }
            None => self.buf.extend_from_slice(chunk),
        }

        if let Some(end) = self.buf.iter().position(|&b| b == END) {
            let mut payload = std::mem::take(&mut self.buf);
            payload.truncate(end);
            return FrameEvent::Complete(payload);
        }
        FrameEvent::Incomplete
    }

    /// GET header framing: text up to the first `#` is the declared size;
    /// the rest of that chunk is already payload.
    fn feed_size_header(&mut self, chunk: &[u8]) -> FrameEvent {
        let Some(end_in_chunk) = chunk.iter().position(|&b| b == END) else {
            self.buf.extend_from_slice(chunk);
            return FrameEvent::Incomplete;
        };

        self.buf.extend_from_slice(&chunk[..end_in_chunk]);
        let header = std::mem::take(&mut self.buf);
        let digits = match header.first() {
            Some(&START) => &header[1..],
            _ => &header[..],
        };

        let text = String::from_utf8_lossy(digits);
        let declared = match text.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                // The transfer still runs; it just completes immediately.
                warn!(size = %text, "unparsable download size, assuming 0");
                0
            }
        };

        FrameEvent::SizeHeader {
            declared,
            payload: chunk[end_in_chunk + 1..].to_vec(),
        }
    }

    /// PUT handshake: wait for a literal `@OK#` or `@KO#` token.
    fn feed_handshake(&mut self, chunk: &[u8]) -> FrameEvent {
        self.buf.extend_from_slice(chunk);
        if contains(&self.buf, b"@OK#") {
            self.buf.clear();
            return FrameEvent::UploadAccepted;
        }
        if contains(&self.buf, b"@KO#") {
            self.buf.clear();
            return FrameEvent::UploadRejected;
        }
        FrameEvent::Incomplete
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `message` split at every possible single position and checks
    /// the reassembled payload never depends on the split point.
    fn assert_split_invariant(cmd: Command, message: &[u8], expect: &[u8]) {
        for cut in 1..message.len() {
            let mut asm = FrameAssembler::new();
            let (a, b) = message.split_at(cut);
            assert_eq!(asm.feed(cmd, a), FrameEvent::Incomplete, "cut at {cut}");
            assert_eq!(
                asm.feed(cmd, b),
                FrameEvent::Complete(expect.to_vec()),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn list_single_chunk_message() {
        let mut asm = FrameAssembler::new();
        assert_eq!(
            asm.feed(Command::List, b"@a.txt,b/#"),
            FrameEvent::Complete(b"a.txt,b/".to_vec())
        );
    }

    #[test]
    fn list_split_anywhere_yields_same_payload() {
        assert_split_invariant(Command::List, b"@dir/,file.txt,../#", b"dir/,file.txt,../");
    }

    #[test]
    fn list_three_way_split() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::List, b"@long,li"), FrameEvent::Incomplete);
        assert_eq!(asm.feed(Command::List, b"sting,of"), FrameEvent::Incomplete);
        assert_eq!(
            asm.feed(Command::List, b",names#"),
            FrameEvent::Complete(b"long,listing,of,names".to_vec())
        );
    }

    #[test]
    fn list_start_marker_discards_stale_partial() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::List, b"@orphaned"), FrameEvent::Incomplete);
        assert_eq!(
            asm.feed(Command::List, b"@fresh#"),
            FrameEvent::Complete(b"fresh".to_vec())
        );
    }

    #[test]
    fn list_markers_mid_chunk_are_payload() {
        // Edge framing only looks at the first and last byte of a chunk.
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::List, b"@we@ird"), FrameEvent::Incomplete);
        assert_eq!(
            asm.feed(Command::List, b"na#me#"),
            FrameEvent::Complete(b"we@irdna#me".to_vec())
        );
    }

    #[test]
    fn info_detects_markers_mid_chunk() {
        // INFO reassembly may begin after the reply is already in flight,
        // so unlike LIST the markers are honoured anywhere in a chunk.
        let mut asm = FrameAssembler::new();
        assert_eq!(
            asm.feed(Command::Info, b"junk@report.pdf%10"),
            FrameEvent::Incomplete
        );
        assert_eq!(
            asm.feed(Command::Info, b"240%2020-01-01%2020-02-02#"),
            FrameEvent::Complete(b"report.pdf%10240%2020-01-01%2020-02-02".to_vec())
        );
    }

    #[test]
    fn info_split_anywhere_yields_same_payload() {
        assert_split_invariant(
            Command::Info,
            b"@a.bin%17%2021-05-05%2021-06-06#",
            b"a.bin%17%2021-05-05%2021-06-06",
        );
    }

    #[test]
    fn delete_frame_completes_on_end_marker_anywhere() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::Delete, b"@OK%no"), FrameEvent::Incomplete);
        assert_eq!(
            asm.feed(Command::Delete, b"tes.txt#"),
            FrameEvent::Complete(b"OK%notes.txt".to_vec())
        );
    }

    #[test]
    fn get_header_with_payload_in_same_chunk() {
        let mut asm = FrameAssembler::new();
        assert_eq!(
            asm.feed(Command::Get, b"@5#abc"),
            FrameEvent::SizeHeader {
                declared: 5,
                payload: b"abc".to_vec(),
            }
        );
    }

    #[test]
    fn get_header_split_across_chunks() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::Get, b"@10"), FrameEvent::Incomplete);
        assert_eq!(asm.feed(Command::Get, b"24"), FrameEvent::Incomplete);
        assert_eq!(
            asm.feed(Command::Get, b"0#\x00\x01"),
            FrameEvent::SizeHeader {
                declared: 10240,
                payload: vec![0x00, 0x01],
            }
        );
    }

    #[test]
    fn get_unparsable_size_degrades_to_zero() {
        let mut asm = FrameAssembler::new();
        assert_eq!(
            asm.feed(Command::Get, b"@x9z#"),
            FrameEvent::SizeHeader {
                declared: 0,
                payload: Vec::new(),
            }
        );
    }

    #[test]
    fn put_handshake_accept_and_reject() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::Put, b"@O"), FrameEvent::Incomplete);
        assert_eq!(asm.feed(Command::Put, b"K#"), FrameEvent::UploadAccepted);

        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::Put, b"@KO#"), FrameEvent::UploadRejected);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.feed(Command::List, b"@half"), FrameEvent::Incomplete);
        asm.reset();
        assert_eq!(
            asm.feed(Command::List, b"@whole#"),
            FrameEvent::Complete(b"whole".to_vec())
        );
    }
}
