//! Nordic UART Service transport for the protocol engine.
//!
//! The bridge exposes the stock UART service: we write request bytes to
//! the TX characteristic (20 bytes at a time, without response) and
//! subscribe to RX notifications for inbound chunks. Connection loss is
//! surfaced through a watch channel fed from the adapter's event stream.

use std::sync::Arc;

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::{uuid, Uuid};

use crate::error::Error;
use crate::link::{ChunkStream, UartLink};

pub const UART_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
pub const UART_TX: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
pub const UART_RX: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// A connected UART bridge.
pub struct BleUart {
    peripheral: Peripheral,
    tx: Characteristic,
    connected: Arc<watch::Sender<bool>>,
}

impl BleUart {
    /// Connects, resolves the UART characteristics and subscribes to
    /// notifications. Returns the link, the inbound chunk stream and the
    /// connected signal for [`crate::SdRemote::spawn`].
    pub async fn connect(
        adapter: &Adapter,
        peripheral: Peripheral,
    ) -> Result<(Arc<Self>, ChunkStream, watch::Receiver<bool>), Error> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let tx = characteristics
            .iter()
            .find(|c| c.uuid == UART_TX)
            .cloned()
            .ok_or(Error::NoUartService)?;
        let rx = characteristics
            .iter()
            .find(|c| c.uuid == UART_RX)
            .cloned()
            .ok_or(Error::NoUartService)?;

        peripheral.subscribe(&rx).await?;
        info!(peripheral = ?peripheral.id(), "UART service connected");

        let chunks = peripheral
            .notifications()
            .await?
            .filter_map(|n| futures::future::ready((n.uuid == UART_RX).then_some(n.value)))
            .boxed();

        let (connected_tx, connected_rx) = watch::channel(true);
        let connected = Arc::new(connected_tx);
        spawn_disconnect_watch(adapter, peripheral.id(), Arc::clone(&connected)).await?;

        let link = Arc::new(Self {
            peripheral,
            tx,
            connected,
        });
        Ok((link, chunks, connected_rx))
    }

    /// Tears the connection down and marks the link disconnected.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let _ = self.connected.send(false);
        self.peripheral.disconnect().await?;
        info!("BLE connection closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl UartLink for BleUart {
    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), Error> {
        self.peripheral
            .write(&self.tx, chunk, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

/// Flips the connected signal when the adapter reports our peripheral
/// gone.
async fn spawn_disconnect_watch(
    adapter: &Adapter,
    id: btleplug::platform::PeripheralId,
    connected: Arc<watch::Sender<bool>>,
) -> Result<(), Error> {
    let mut events = adapter.events().await?;
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone == id {
                    debug!(peripheral = ?id, "device disconnected");
                    let _ = connected.send(false);
                    break;
                }
            }
        }
    });
    Ok(())
}
