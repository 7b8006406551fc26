//! Error types for the UART filesystem client.

/// Errors produced while talking to the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another command is already in flight")]
    Busy,

    #[error("transport is not connected")]
    NotConnected,

    #[error("timed out waiting for a reply")]
    ReplyTimeout,

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("remote rejected the request: {0}")]
    Rejected(String),

    #[error("UART service characteristics not found")]
    NoUartService,

    #[error("client is shut down")]
    Closed,
}
