//! The protocol engine and its public handle.
//!
//! One engine task owns everything the protocol needs to agree on: the
//! command in flight, the frame reassembly buffer and the active download
//! session. Inbound chunks, caller requests, the connection signal and the
//! reply deadline all meet in its select loop, so no protocol state is
//! ever shared between contexts. Upload streaming runs on its own worker
//! task, which owns the source file and talks back only through the link
//! and the event channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, Command};
use crate::error::Error;
use crate::event::Event;
use crate::frame::{FrameAssembler, FrameEvent};
use crate::link::{self, ChunkStream, UartLink};
use crate::listing::parse_listing;
use crate::transfer::{DownloadSession, UploadSession, READ_SLICE};

/// How long a command may wait for its next inbound chunk before it is
/// failed. The wire protocol itself has no liveness guarantee.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a request waits for the transport to come up before failing
/// with [`Error::NotConnected`].
const CONNECT_WAIT: Duration = Duration::from_secs(20);

/// Pause after the last upload byte so the bridge's write queue drains
/// before the transfer is declared done.
const UPLOAD_SETTLE: Duration = Duration::from_secs(1);

enum Op {
    List { path: String },
    Info { path: String },
    Delete { path: String },
    Download { remote: String, dest: PathBuf },
    Upload { source: PathBuf, remote: String },
}

struct Request {
    op: Op,
    ack: oneshot::Sender<Result<(), Error>>,
}

/// Handle to a running protocol engine.
///
/// All methods enqueue a command and resolve once it has been accepted and
/// put on the wire; outcomes arrive on the event channel returned by
/// [`SdRemote::spawn`]. Issuing a command while another is in flight fails
/// with [`Error::Busy`] before any wire traffic.
#[derive(Clone)]
pub struct SdRemote {
    tx: mpsc::Sender<Request>,
}

impl SdRemote {
    /// Spawns the engine over a link, its inbound chunk stream and the
    /// transport's connected signal.
    pub fn spawn(
        link: Arc<dyn UartLink>,
        chunks: ChunkStream,
        connected: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (tx, cmd_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (upload_done_tx, upload_done_rx) = mpsc::channel(1);

        let engine = Engine {
            link,
            chunks,
            connected,
            cmd_rx,
            events: events_tx,
            upload_done_tx,
            upload_done_rx,
            asm: FrameAssembler::new(),
            state: State::Idle,
        };
        tokio::spawn(engine.run());

        (Self { tx }, events_rx)
    }

    /// Requests the listing of a remote directory (empty path = root).
    pub async fn list(&self, path: &str) -> Result<(), Error> {
        self.submit(Op::List { path: path.to_owned() }).await
    }

    /// Requests metadata for one remote file.
    pub async fn info(&self, path: &str) -> Result<(), Error> {
        self.submit(Op::Info { path: path.to_owned() }).await
    }

    /// Asks the bridge to delete one remote file.
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        self.submit(Op::Delete { path: path.to_owned() }).await
    }

    /// Starts downloading a remote file into `dest`. The destination is
    /// prepared (and any existing file replaced) before the request goes
    /// out.
    pub async fn download(&self, remote: &str, dest: &Path) -> Result<(), Error> {
        self.submit(Op::Download {
            remote: remote.to_owned(),
            dest: dest.to_path_buf(),
        })
        .await
    }

    /// Starts uploading a local file into the remote directory
    /// `remote_dir` (empty = root), keeping its file name.
    pub async fn upload(&self, source: &Path, remote_dir: &str) -> Result<(), Error> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "source has no usable file name",
                ))
            })?;
        let remote = codec::join_remote(remote_dir, name);
        self.submit(Op::Upload {
            source: source.to_path_buf(),
            remote,
        })
        .await
    }

    async fn submit(&self, op: Op) -> Result<(), Error> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Request { op, ack })
            .await
            .map_err(|_| Error::Closed)?;
        ack_rx.await.map_err(|_| Error::Closed)?
    }
}

/// What the engine is currently doing. Exactly one command may be in
/// flight; the variant also selects the reassembly rules for inbound
/// chunks.
enum State {
    Idle,
    /// LIST, INFO or DELETE sent, reply frame being assembled.
    Awaiting(Command),
    /// GET sent, size header being assembled. The destination is already
    /// open.
    GetHeader(DownloadSession),
    /// GET header done, raw payload streaming into the destination.
    GetPayload(DownloadSession),
    /// PUT sent, handshake token being assembled. The source is already
    /// open.
    PutHandshake(UploadSession),
    /// Upload worker is streaming the source; nothing inbound expected.
    PutStream,
}

struct Engine {
    link: Arc<dyn UartLink>,
    chunks: ChunkStream,
    connected: watch::Receiver<bool>,
    cmd_rx: mpsc::Receiver<Request>,
    events: mpsc::Sender<Event>,
    upload_done_tx: mpsc::Sender<()>,
    upload_done_rx: mpsc::Receiver<()>,
    asm: FrameAssembler,
    state: State,
}

impl Engine {
    async fn run(mut self) {
        let deadline = tokio::time::sleep(REPLY_TIMEOUT);
        tokio::pin!(deadline);
        let mut stream_done = false;
        let mut watch_done = false;

        loop {
            let awaiting_reply = matches!(
                self.state,
                State::Awaiting(_)
                    | State::GetHeader(_)
                    | State::GetPayload(_)
                    | State::PutHandshake(_)
            );

            tokio::select! {
                req = self.cmd_rx.recv() => {
                    let Some(req) = req else {
                        debug!("all handles dropped, engine stopping");
                        break;
                    };
                    if self.handle_request(req).await {
                        deadline.as_mut().reset(Instant::now() + REPLY_TIMEOUT);
                    }
                }

                chunk = self.chunks.next(), if !stream_done => {
                    match chunk {
                        Some(chunk) => {
                            deadline.as_mut().reset(Instant::now() + REPLY_TIMEOUT);
                            self.handle_chunk(&chunk).await;
                        }
                        None => {
                            stream_done = true;
                            self.handle_disconnect().await;
                        }
                    }
                }

                changed = self.connected.changed(), if !watch_done => {
                    match changed {
                        Ok(()) if !*self.connected.borrow() => {
                            self.handle_disconnect().await;
                        }
                        Ok(()) => {}
                        Err(_) => watch_done = true,
                    }
                }

                Some(()) = self.upload_done_rx.recv() => {
                    if matches!(self.state, State::PutStream) {
                        self.state = State::Idle;
                    }
                }

                () = &mut deadline, if awaiting_reply => {
                    self.handle_timeout().await;
                }
            }
        }
    }

    /// Returns true when a reply wait began and the deadline must be armed.
    async fn handle_request(&mut self, req: Request) -> bool {
        if !matches!(self.state, State::Idle) {
            let _ = req.ack.send(Err(Error::Busy));
            return false;
        }
        if let Err(e) = self.await_connected().await {
            let _ = req.ack.send(Err(e));
            return false;
        }

        match req.op {
            Op::List { path } => {
                self.issue(Command::List, codec::encode_list(&path), req.ack)
                    .await
            }
            Op::Info { path } => {
                self.issue(Command::Info, codec::encode_info(&path), req.ack)
                    .await
            }
            Op::Delete { path } => {
                self.issue(Command::Delete, codec::encode_delete(&path), req.ack)
                    .await
            }
            Op::Download { remote, dest } => {
                let session = match DownloadSession::open(&dest) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(dest = %dest.display(), error = %e, "cannot prepare download destination");
                        let _ = req.ack.send(Err(e));
                        return false;
                    }
                };
                if self.issue(Command::Get, codec::encode_get(&remote), req.ack).await {
                    self.state = State::GetHeader(session);
                    return true;
                }
                false
            }
            Op::Upload { source, remote } => {
                let session = match UploadSession::open(&source) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(source = %source.display(), error = %e, "cannot open upload source");
                        let _ = req.ack.send(Err(e));
                        return false;
                    }
                };
                let request = codec::encode_put(&remote, session.total());
                if self.issue(Command::Put, request, req.ack).await {
                    self.state = State::PutHandshake(session);
                    return true;
                }
                false
            }
        }
    }

    /// Sends one encoded request and, for the plain text commands, moves
    /// to the matching wait state.
    async fn issue(
        &mut self,
        cmd: Command,
        request: Vec<u8>,
        ack: oneshot::Sender<Result<(), Error>>,
    ) -> bool {
        self.asm.reset();
        debug!(command = %cmd, "sending request");
        match link::send_paced(&*self.link, &request).await {
            Ok(()) => {
                if matches!(cmd, Command::List | Command::Info | Command::Delete) {
                    self.state = State::Awaiting(cmd);
                }
                let _ = ack.send(Ok(()));
                true
            }
            Err(e) => {
                self.state = State::Idle;
                let _ = ack.send(Err(e));
                false
            }
        }
    }

    async fn await_connected(&mut self) -> Result<(), Error> {
        if *self.connected.borrow() {
            return Ok(());
        }
        info!("waiting for the transport to connect");
        match tokio::time::timeout(CONNECT_WAIT, self.connected.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    async fn handle_chunk(&mut self, chunk: &[u8]) {
        trace!(len = chunk.len(), "chunk received");
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                debug!("ignoring chunk with no command in flight");
            }
            State::Awaiting(cmd) => match self.asm.feed(cmd, chunk) {
                FrameEvent::Incomplete => self.state = State::Awaiting(cmd),
                FrameEvent::Complete(payload) => self.finish_text_command(cmd, &payload).await,
                other => {
                    warn!(command = %cmd, ?other, "unexpected frame event");
                    self.state = State::Awaiting(cmd);
                }
            },
            State::GetHeader(mut session) => match self.asm.feed(Command::Get, chunk) {
                FrameEvent::Incomplete => self.state = State::GetHeader(session),
                FrameEvent::SizeHeader { declared, payload } => {
                    session.set_declared(declared);
                    self.emit(Event::DownloadStarted { declared }).await;
                    self.advance_download(session, &payload).await;
                }
                other => {
                    warn!(?other, "unexpected frame event for GET header");
                    self.state = State::GetHeader(session);
                }
            },
            State::GetPayload(session) => {
                self.advance_download(session, chunk).await;
            }
            State::PutHandshake(session) => match self.asm.feed(Command::Put, chunk) {
                FrameEvent::Incomplete => self.state = State::PutHandshake(session),
                FrameEvent::UploadAccepted => {
                    info!(
                        source = %session.source().display(),
                        total = session.total(),
                        "upload accepted, streaming"
                    );
                    self.emit(Event::UploadStarted {
                        total: session.total(),
                    })
                    .await;
                    self.spawn_upload(session);
                    self.state = State::PutStream;
                }
                FrameEvent::UploadRejected => {
                    self.fail(Command::Put, "remote rejected the upload").await;
                }
                other => {
                    warn!(?other, "unexpected frame event for PUT handshake");
                    self.state = State::PutHandshake(session);
                }
            },
            State::PutStream => {
                debug!("ignoring chunk while streaming an upload");
                self.state = State::PutStream;
            }
        }
    }

    async fn finish_text_command(&mut self, cmd: Command, payload: &[u8]) {
        match cmd {
            Command::List => {
                let nodes = parse_listing(payload);
                info!(entries = nodes.len(), "listing received");
                self.emit(Event::ListingReady(nodes)).await;
            }
            Command::Info => match codec::decode_info(payload) {
                Ok(i) => self.emit(Event::InfoReady(i)).await,
                Err(e) => self.fail(cmd, &e.to_string()).await,
            },
            Command::Delete => match codec::decode_delete(payload) {
                Ok(name) => {
                    info!(name = %name, "file deleted");
                    self.emit(Event::DeleteDone { name }).await;
                }
                Err(e) => self.fail(cmd, &e.to_string()).await,
            },
            Command::Get | Command::Put => unreachable!("handled by dedicated states"),
        }
    }

    /// Writes one payload slice (possibly empty) and either finishes the
    /// download or keeps waiting for more.
    async fn advance_download(&mut self, mut session: DownloadSession, slice: &[u8]) {
        if !slice.is_empty() {
            match session.write_slice(slice) {
                Ok(received) => {
                    self.emit(Event::DownloadProgress {
                        received,
                        declared: session.declared(),
                    })
                    .await;
                }
                Err(e) => {
                    session.abort();
                    self.fail(Command::Get, &format!("write failed: {e}")).await;
                    return;
                }
            }
        }

        if session.is_complete() {
            let received = session.received();
            match session.finish() {
                Ok(dest) => {
                    info!(dest = %dest.display(), bytes = received, "download complete");
                    self.emit(Event::DownloadDone { dest }).await;
                    self.state = State::Idle;
                }
                Err(e) => self.fail(Command::Get, &format!("close failed: {e}")).await,
            }
        } else {
            self.state = State::GetPayload(session);
        }
    }

    fn spawn_upload(&self, session: UploadSession) {
        let link = Arc::clone(&self.link);
        let events = self.events.clone();
        let done = self.upload_done_tx.clone();
        tokio::spawn(async move {
            let source = session.source().to_path_buf();
            match stream_upload(link, session, &events).await {
                Ok(()) => {
                    info!(source = %source.display(), "upload complete");
                    let _ = events.send(Event::UploadDone { source }).await;
                }
                Err(e) => {
                    warn!(source = %source.display(), error = %e, "upload failed");
                    let _ = events
                        .send(Event::CommandFailed {
                            command: Command::Put,
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            let _ = done.send(()).await;
        });
    }

    async fn handle_timeout(&mut self) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Awaiting(cmd) => {
                self.asm.reset();
                self.fail(cmd, &Error::ReplyTimeout.to_string()).await;
            }
            State::GetHeader(mut session) | State::GetPayload(mut session) => {
                session.abort();
                self.asm.reset();
                self.fail(Command::Get, &Error::ReplyTimeout.to_string())
                    .await;
            }
            State::PutHandshake(_) => {
                self.asm.reset();
                self.fail(Command::Put, &Error::ReplyTimeout.to_string())
                    .await;
            }
            other => self.state = other,
        }
    }

    /// Transport loss invalidates whatever was in flight; the upload
    /// worker reports its own failure when its next write errors.
    async fn handle_disconnect(&mut self) {
        warn!("transport disconnected");
        self.asm.reset();
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {}
            State::Awaiting(cmd) => {
                self.fail(cmd, &Error::NotConnected.to_string()).await;
            }
            State::GetHeader(mut session) | State::GetPayload(mut session) => {
                session.abort();
                self.fail(Command::Get, &Error::NotConnected.to_string())
                    .await;
            }
            State::PutHandshake(_) => {
                self.fail(Command::Put, &Error::NotConnected.to_string())
                    .await;
            }
            State::PutStream => self.state = State::PutStream,
        }
        self.emit(Event::Disconnected).await;
    }

    async fn fail(&mut self, command: Command, message: &str) {
        warn!(command = %command, message, "command failed");
        self.state = State::Idle;
        self.emit(Event::CommandFailed {
            command,
            message: message.to_owned(),
        })
        .await;
    }

    async fn emit(&mut self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

/// Streams the whole source over the link in paced slices, then the `\r`
/// flush byte the bridge needs to close its receive path.
async fn stream_upload(
    link: Arc<dyn UartLink>,
    mut session: UploadSession,
    events: &mpsc::Sender<Event>,
) -> Result<(), Error> {
    let total = session.total();
    let mut buf = [0u8; READ_SLICE];
    loop {
        let n = session.read_slice(&mut buf)?;
        if n > 0 {
            link::send_paced(&*link, &buf[..n]).await?;
            let _ = events
                .send(Event::UploadProgress {
                    sent: session.sent(),
                    total,
                })
                .await;
        }
        if n < READ_SLICE {
            link::send_paced(&*link, b"\r").await?;
            break;
        }
    }
    tokio::time::sleep(UPLOAD_SETTLE).await;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testutil::harness;
    use super::*;
    use crate::listing::NodeKind;

    #[tokio::test(start_paused = true)]
    async fn list_round_trip_emits_sorted_listing() {
        let mut h = harness(None);
        h.remote.list("").await.unwrap();
        assert_eq!(h.sent(), b"@LIST#");

        h.push(b"@z.txt,b");
        h.push(b"/,../#");

        match h.events.recv().await.unwrap() {
            Event::ListingReady(nodes) => {
                let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
                assert_eq!(names, ["..", "b", "z.txt"]);
                assert_eq!(nodes[1].kind, NodeKind::Directory);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_command_is_rejected_before_wire_bytes() {
        let mut h = harness(None);
        h.remote.list("").await.unwrap();
        let writes_after_first = h.write_count();

        let err = h.remote.info("x").await.unwrap_err();
        assert!(matches!(err, Error::Busy));
        assert_eq!(h.write_count(), writes_after_first);

        // The engine accepts new commands again once the reply lands.
        h.push(b"@a#");
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::ListingReady(_)
        ));
        h.remote.info("x").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn info_reply_is_decoded() {
        let mut h = harness(None);
        h.remote.info("report.pdf").await.unwrap();
        assert_eq!(h.sent(), b"@INFO:report.pdf#");

        h.push(b"@report.pdf%10240%20");
        h.push(b"20-01-01%2020-02-02#");

        match h.events.recv().await.unwrap() {
            Event::InfoReady(info) => {
                assert_eq!(info.name, "report.pdf");
                assert_eq!(info.size, 10240);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delete_rejection_is_terminal_error() {
        let mut h = harness(None);
        h.remote.delete("locked.bin").await.unwrap();
        h.push(b"@ERR#");

        match h.events.recv().await.unwrap() {
            Event::CommandFailed { command, .. } => assert_eq!(command, Command::Delete),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn download_writes_exactly_the_declared_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("hello.txt");

        let mut h = harness(None);
        h.remote.download("hello.txt", &dest).await.unwrap();
        assert_eq!(h.sent(), b"@GETF:hello.txt#");

        h.push(b"@11#hello");
        h.push(b" world");

        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadStarted { declared: 11 }
        ));
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadProgress { received: 5, .. }
        ));
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadProgress { received: 11, .. }
        ));
        match h.events.recv().await.unwrap() {
            Event::DownloadDone { dest: done } => assert_eq!(done, dest),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn short_delivery_never_completes_and_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(None);
        h.remote
            .download("big.bin", &dir.path().join("big.bin"))
            .await
            .unwrap();

        h.push(b"@10#abcd");

        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadStarted { declared: 10 }
        ));
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadProgress { received: 4, .. }
        ));
        // Nothing else arrives; the reply deadline fails the command.
        match h.events.recv().await.unwrap() {
            Event::CommandFailed { command, .. } => assert_eq!(command, Command::Get),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_size_degrades_to_an_empty_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("odd.bin");
        let mut h = harness(None);
        h.remote.download("odd.bin", &dest).await.unwrap();

        h.push(b"@garbled#");

        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadStarted { declared: 0 }
        ));
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::DownloadDone { .. }
        ));
        assert_eq!(std::fs::read(&dest).unwrap(), b"");
    }

    #[tokio::test(start_paused = true)]
    async fn upload_streams_slices_and_flush_byte() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("up.bin");
        let body: Vec<u8> = (0..100u8).collect();
        std::fs::write(&src, &body).unwrap();

        let mut h = harness(None);
        h.remote.upload(&src, "data").await.unwrap();
        assert_eq!(h.sent(), b"@PUTF:data/up.bin%100#");
        let request_writes = h.write_count();

        h.push(b"@OK#");

        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::UploadStarted { total: 100 }
        ));
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::UploadProgress {
                sent: 100,
                total: 100
            }
        ));
        match h.events.recv().await.unwrap() {
            Event::UploadDone { source } => assert_eq!(source, src),
            other => panic!("unexpected event: {other:?}"),
        }

        let writes = h.writes.lock().unwrap();
        let streamed = &writes[request_writes..];
        assert_eq!(streamed.last().unwrap().as_slice(), b"\r");
        let payload: Vec<u8> = streamed[..streamed.len() - 1].concat();
        assert_eq!(payload, body);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_rejection_frees_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("up.bin");
        std::fs::write(&src, b"data").unwrap();

        let mut h = harness(None);
        h.remote.upload(&src, "").await.unwrap();
        h.push(b"@KO#");

        match h.events.recv().await.unwrap() {
            Event::CommandFailed { command, .. } => assert_eq!(command, Command::Put),
            other => panic!("unexpected event: {other:?}"),
        }

        // The rejection is terminal; the next command is accepted.
        h.remote.list("").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_the_inflight_command() {
        let mut h = harness(None);
        h.remote.list("").await.unwrap();

        h.connected_tx.send(true).unwrap(); // no-op change
        h.connected_tx.send(false).unwrap();

        match h.events.recv().await.unwrap() {
            Event::CommandFailed { command, .. } => assert_eq!(command, Command::List),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            h.events.recv().await.unwrap(),
            Event::Disconnected
        ));

        // Still disconnected: the next command fails after the bounded wait.
        let err = h.remote.list("").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
