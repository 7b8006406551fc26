//! Client for the `@…#`-framed remote-filesystem protocol spoken by BLE
//! UART SD-card bridges (Nordic UART Service).
//!
//! The bridge understands five text requests and answers over the RX
//! notification characteristic in chunks of at most 20 bytes:
//!
//! | Request | Reply |
//! |---|---|
//! | `@LIST#` / `@LIST:<path>#` | `@<entries>#`, comma separated; `name/` = directory, `../` = parent |
//! | `@INFO:<path>#` | `@<name>%<size>%<created>%<modified>#` |
//! | `@DELF:<path>#` | `@OK%<name>#`, anything else is a refusal |
//! | `@GETF:<path>#` | `@<size>#` followed by exactly `<size>` raw bytes |
//! | `@PUTF:<path>%<size>#` | `@OK#` to proceed or `@KO#`; the body then streams from us, ending in `\r` |
//!
//! [`SdRemote`] runs the protocol engine on its own task: commands go in
//! one at a time, outcomes come back as [`Event`]s. [`ble::BleUart`]
//! provides the transport; anything implementing [`link::UartLink`] plus
//! a chunk stream works, which is how the tests drive the engine without
//! a radio.

pub mod batch;
pub mod ble;
pub mod client;
pub mod codec;
pub mod error;
pub mod event;
pub mod frame;
pub mod link;
pub mod listing;
pub mod transfer;

pub use batch::{run_deletes, run_downloads, BatchReport, DownloadTarget, ItemOutcome};
pub use client::SdRemote;
pub use codec::{Command, FileInfo};
pub use error::Error;
pub use event::Event;
pub use listing::{FsNode, NodeKind};
