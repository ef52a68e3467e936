//! The BLE operations the client needs, independent of any particular Bluetooth stack.
//!
//! A [`Transport`] finds and connects to the vehicle, a [`Connection`] hands out
//! characteristics, and a [`Characteristic`] is written to and notified from. The client
//! owns the connection; fragmentation and reassembly only borrow a characteristic for the
//! length of one exchange.

#[cfg(feature = "bluest")]
pub mod bluest;
pub mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub const SERVICE_UUID: u128 = 0x00000211_b2d1_43f0_9b88_960cebf8b91e;
pub const WRITE_CHARACTERISTIC_UUID: u128 = 0x00000212_b2d1_43f0_9b88_960cebf8b91e;
pub const READ_CHARACTERISTIC_UUID: u128 = 0x00000213_b2d1_43f0_9b88_960cebf8b91e;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Something `connect` can reach again later without scanning, e.g. a device id.
    type Address: Clone + fmt::Debug + Send + Sync + 'static;
    type Connection: Connection;

    /// Look for a device advertising `name`. `Ok(None)` when the scan ran out of time.
    async fn scan(&self, name: &str, timeout: Duration) -> Result<Option<Self::Address>>;

    async fn connect(&self, address: &Self::Address, timeout: Duration) -> Result<Self::Connection>;
}

#[async_trait]
pub trait Connection: Send {
    type Characteristic: Characteristic;

    /// Returns the MTU actually in effect. Callers treat failure as non-fatal.
    async fn negotiate_mtu(&mut self, mtu: u16) -> Result<u16>;

    async fn open_characteristic(&mut self, service: u128, characteristic: u128) -> Result<Self::Characteristic>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Characteristic: Send {
    async fn subscribe(&mut self, enable: bool) -> Result<()>;

    async fn write(&mut self, bytes: &[u8], require_ack: bool) -> Result<()>;

    /// Wait up to `timeout` for the next notification. `Ok(None)` means nothing arrived.
    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}
