//! [`Transport`] backed by the `bluest` cross-platform BLE library.

use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Device, DeviceId, Uuid};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{Characteristic, Connection, Transport};
use crate::error::{Error, Result};

pub struct BluestTransport {
    adapter: Adapter,
}

impl BluestTransport {
    /// Use the system's default Bluetooth adapter, waiting until it is powered on.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default().await.ok_or(Error::connection_failed("default adapter not found"))?;
        adapter.wait_available().await?;
        Ok(Self { adapter })
    }
}

#[async_trait]
impl Transport for BluestTransport {
    type Address = DeviceId;
    type Connection = BluestConnection;

    async fn scan(&self, name: &str, scan_timeout: Duration) -> Result<Option<DeviceId>> {
        let discover = async {
            let mut adapter_events = self.adapter.scan(&[]).await?;
            while let Some(device) = adapter_events.next().await {
                let device_name = match &device.adv_data.local_name {
                    Some(local_name) => local_name.clone(),
                    None => device.device.name_async().await.unwrap_or_default(),
                };
                if device_name == name {
                    debug!(name, rssi = ?device.rssi, "found vehicle");
                    return Ok(Some(device.device.id()));
                }
            }
            Ok::<_, Error>(None)
        };

        match timeout(scan_timeout, discover).await {
            Ok(found) => found,
            Err(_) => Ok(None),
        }
    }

    async fn connect(&self, address: &DeviceId, connect_timeout: Duration) -> Result<BluestConnection> {
        let device = self.adapter.open_device(address).await?;
        timeout(connect_timeout, self.adapter.connect_device(&device))
            .await
            .map_err(|_| Error::connection_failed(format!("connection timed out after {connect_timeout:?}")))??;
        Ok(BluestConnection { adapter: self.adapter.clone(), device })
    }
}

pub struct BluestConnection {
    adapter: Adapter,
    device: Device,
}

#[async_trait]
impl Connection for BluestConnection {
    type Characteristic = BluestCharacteristic;

    async fn negotiate_mtu(&mut self, mtu: u16) -> Result<u16> {
        // The platform stack negotiates the MTU itself while connecting.
        Ok(mtu)
    }

    async fn open_characteristic(&mut self, service: u128, characteristic: u128) -> Result<BluestCharacteristic> {
        let service = self
            .device
            .discover_services_with_uuid(Uuid::from_u128(service))
            .await?
            .first()
            .ok_or(Error::connection_failed("the vehicle does not expose the status service"))?
            .clone();
        let inner = service
            .discover_characteristics_with_uuid(Uuid::from_u128(characteristic))
            .await?
            .first()
            .ok_or_else(|| Error::connection_failed(format!("characteristic {characteristic:032x} not found")))?
            .clone();
        Ok(BluestCharacteristic { inner, notifications: None, forwarder: None })
    }

    async fn close(&mut self) -> Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}

type Notification = std::result::Result<Vec<u8>, bluest::Error>;

/// The notify stream borrows the characteristic, so a spawned task owns a clone of it and
/// forwards notifications over a channel.
pub struct BluestCharacteristic {
    inner: bluest::Characteristic,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    forwarder: Option<JoinHandle<()>>,
}

impl BluestCharacteristic {
    fn stop_forwarding(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.notifications = None;
    }
}

impl Drop for BluestCharacteristic {
    fn drop(&mut self) {
        self.stop_forwarding();
    }
}

#[async_trait]
impl Characteristic for BluestCharacteristic {
    async fn subscribe(&mut self, enable: bool) -> Result<()> {
        self.stop_forwarding();
        if !enable {
            return Ok(());
        }

        let characteristic = self.inner.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let forwarder = tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                if tx.send(notification).is_err() {
                    break;
                }
            }
            trace!("notification stream ended");
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                self.notifications = Some(rx);
                self.forwarder = Some(forwarder);
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(Error::connection_failed("notification task ended before subscribing")),
        }
    }

    async fn write(&mut self, bytes: &[u8], require_ack: bool) -> Result<()> {
        if require_ack {
            self.inner.write(bytes).await?;
        } else {
            self.inner.write_without_response(bytes).await?;
        }
        Ok(())
    }

    async fn next_notification(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let notifications =
            self.notifications.as_mut().ok_or_else(|| Error::connection_failed("not subscribed to notifications"))?;
        match timeout(wait, notifications.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(None) => Err(Error::connection_failed("notification stream ended")),
        }
    }
}
