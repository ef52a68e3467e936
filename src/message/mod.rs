//! Messages exchanged with the vehicle's BLE endpoint.
//!
//! Every message is a `RoutableMessage` envelope. Requests are sent with a 2-byte big-endian
//! length header ([`Frame`]); responses arrive without it.

pub mod status_request;
pub mod status_response;

use crate::error::{Error, Result};

/// `RoutableMessage` field numbers used by this crate.
pub(crate) mod routable {
    pub const TO_DESTINATION: u32 = 6;
    pub const FROM_DESTINATION: u32 = 7;
    pub const PAYLOAD: u32 = 10;
    pub const SIGNATURE_DATA: u32 = 13;
    pub const SESSION_INFO_REQUEST: u32 = 14;
    pub const SESSION_INFO: u32 = 15;
    pub const UUID: u32 = 51;
    pub const FLAGS: u32 = 52;

    /// `Destination` sub-message fields.
    pub const DESTINATION_DOMAIN: u32 = 1;
    pub const DESTINATION_ROUTING_ADDRESS: u32 = 2;
}

/// The subsystem inside the vehicle a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    VehicleSecurity = 2,
    Infotainment = 3,
}

impl Domain {
    pub fn wire_value(self) -> u64 {
        self as u64
    }
}

/// A length-prefixed message ready to be written to the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub const HEADER_LEN: usize = 2;

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let len = u16::try_from(payload.len()).map_err(|_| Error::FrameTooLarge { len: payload.len() })?;
        let mut bytes = Vec::with_capacity(Self::HEADER_LEN + payload.len());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(payload);
        Ok(Frame(bytes))
    }

    pub fn declared_len(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[Self::HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A fresh 16-byte value for routing addresses and request ids.
pub(crate) fn random_id() -> [u8; 16] {
    rand::random()
}
