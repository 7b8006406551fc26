//! The byte-pipe boundary between the protocol engine and the transport.
//!
//! The engine only ever needs two things from the link: a way to push one
//! chunk of at most [`CHUNK_LEN`] bytes, and (elsewhere) a stream of inbound
//! chunks. Everything BLE-specific lives behind [`UartLink`] so the engine
//! can be exercised against an in-memory link in tests.

use std::time::Duration;

use futures::stream::BoxStream;

use crate::error::Error;

/// Inbound chunk deliveries, one item per transport notification.
pub type ChunkStream = BoxStream<'static, Vec<u8>>;

/// Hard ceiling on a single UART write. The bridge drops anything longer.
pub const CHUNK_LEN: usize = 20;

/// Pause after every low-level write. Without it the receiver does not
/// recognise the next write as a separate chunk.
pub const PACE_DELAY: Duration = Duration::from_millis(100);

/// One outbound write of at most [`CHUNK_LEN`] bytes.
#[async_trait::async_trait]
pub trait UartLink: Send + Sync {
    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), Error>;
}

/// Splits `data` into [`CHUNK_LEN`]-sized writes with [`PACE_DELAY`]
/// pacing after each one.
pub(crate) async fn send_paced(link: &dyn UartLink, data: &[u8]) -> Result<(), Error> {
    for chunk in data.chunks(CHUNK_LEN) {
        link.write_chunk(chunk).await?;
        tokio::time::sleep(PACE_DELAY).await;
    }
    Ok(())
}
