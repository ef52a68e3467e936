//! In-memory transport with scripted notifications.
//!
//! Used by the test suite, and handy for replaying captured vehicle traffic without a
//! radio. Every handle shares one [`MockState`], so a test can keep a clone of the
//! transport after handing it to a client and inspect what was written.
//!
//! Scripted events are the vehicle's reply to the next request: they become readable when
//! the next write succeeds, or immediately after [`MockTransport::deliver`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{Characteristic, Connection, Transport, READ_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};

/// One step of the notification script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Notify(Vec<u8>),
    /// The vehicle stays quiet for this long before the next event.
    Silence(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub bytes: Vec<u8>,
    pub require_ack: bool,
}

#[derive(Debug, Default)]
pub struct MockState {
    advertised: Vec<(String, String)>,
    unreachable: HashSet<String>,
    script: VecDeque<MockEvent>,
    /// Events waiting for the next write.
    replies: VecDeque<MockEvent>,
    writes: Vec<RecordedWrite>,
    fail_write_at: Option<usize>,
    mtu: Option<u16>,
    scans: usize,
    connects: Vec<String>,
    subscribed: bool,
    closes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make a device named `name` discoverable at `address`.
    pub fn advertise(&self, name: &str, address: &str) -> &Self {
        self.lock().advertised.push((name.to_owned(), address.to_owned()));
        self
    }

    /// Connections to `address` fail from now on.
    pub fn set_unreachable(&self, address: &str) -> &Self {
        self.lock().unreachable.insert(address.to_owned());
        self
    }

    /// MTU granted by `negotiate_mtu`; `None` makes negotiation fail.
    pub fn set_mtu(&self, mtu: Option<u16>) -> &Self {
        self.lock().mtu = mtu;
        self
    }

    pub fn notify(&self, bytes: &[u8]) -> &Self {
        self.lock().replies.push_back(MockEvent::Notify(bytes.to_vec()));
        self
    }

    pub fn silence(&self, duration: Duration) -> &Self {
        self.lock().replies.push_back(MockEvent::Silence(duration));
        self
    }

    /// Make the queued events readable without waiting for a write.
    pub fn deliver(&self) -> &Self {
        let mut state = self.lock();
        let replies = std::mem::take(&mut state.replies);
        state.script.extend(replies);
        self
    }

    /// Queue each chunk as its own notification.
    pub fn notify_chunked(&self, bytes: &[u8], chunk_size: usize) -> &Self {
        for chunk in bytes.chunks(chunk_size.max(1)) {
            self.notify(chunk);
        }
        self
    }

    /// The write with this zero-based index, counted across the session, fails.
    pub fn fail_write_at(&self, index: usize) -> &Self {
        self.lock().fail_write_at = Some(index);
        self
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    /// All written chunks joined back together.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock().writes.iter().flat_map(|w| w.bytes.iter().copied()).collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn scans(&self) -> usize {
        self.lock().scans
    }

    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().subscribed
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Events not yet read, whether readable now or waiting for a write.
    pub fn pending_events(&self) -> usize {
        let state = self.lock();
        state.script.len() + state.replies.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Address = String;
    type Connection = MockConnection;

    async fn scan(&self, name: &str, _timeout: Duration) -> Result<Option<String>> {
        let mut state = self.lock();
        state.scans += 1;
        Ok(state.advertised.iter().find(|(advertised, _)| advertised == name).map(|(_, address)| address.clone()))
    }

    async fn connect(&self, address: &String, _timeout: Duration) -> Result<MockConnection> {
        let mut state = self.lock();
        state.connects.push(address.clone());
        if state.unreachable.contains(address) {
            return Err(Error::connection_failed(format!("{address} did not answer")));
        }
        Ok(MockConnection { transport: self.clone() })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    transport: MockTransport,
}

#[async_trait]
impl Connection for MockConnection {
    type Characteristic = MockCharacteristic;

    async fn negotiate_mtu(&mut self, _mtu: u16) -> Result<u16> {
        self.transport.lock().mtu.ok_or_else(|| Error::connection_failed("MTU exchange not supported"))
    }

    async fn open_characteristic(&mut self, service: u128, characteristic: u128) -> Result<MockCharacteristic> {
        let known = [WRITE_CHARACTERISTIC_UUID, READ_CHARACTERISTIC_UUID];
        if service != SERVICE_UUID || !known.contains(&characteristic) {
            return Err(Error::connection_failed(format!("characteristic {characteristic:032x} not found")));
        }
        Ok(MockCharacteristic { transport: self.transport.clone() })
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.transport.lock();
        state.closes += 1;
        state.subscribed = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockCharacteristic {
    transport: MockTransport,
}

#[async_trait]
impl Characteristic for MockCharacteristic {
    async fn subscribe(&mut self, enable: bool) -> Result<()> {
        self.transport.lock().subscribed = enable;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8], require_ack: bool) -> Result<()> {
        let mut state = self.transport.lock();
        if state.fail_write_at == Some(state.writes.len()) {
            state.fail_write_at = None;
            return Err(Error::connection_failed("write not acknowledged"));
        }
        state.writes.push(RecordedWrite { bytes: bytes.to_vec(), require_ack });
        let replies = std::mem::take(&mut state.replies);
        state.script.extend(replies);
        Ok(())
    }

    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut waited = Duration::ZERO;
        loop {
            let event = self.transport.lock().script.pop_front();
            match event {
                Some(MockEvent::Notify(bytes)) => return Ok(Some(bytes)),
                Some(MockEvent::Silence(duration)) => {
                    let left = timeout.saturating_sub(waited);
                    if duration < left {
                        tokio::time::sleep(duration).await;
                        waited += duration;
                    } else {
                        tokio::time::sleep(left).await;
                        self.transport.lock().script.push_front(MockEvent::Silence(duration - left));
                        return Ok(None);
                    }
                }
                None => {
                    tokio::time::sleep(timeout.saturating_sub(waited)).await;
                    return Ok(None);
                }
            }
        }
    }
}
