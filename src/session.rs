//! Session establishment and command signing.
//!
//! The status query needs none of this. It is here for commands the vehicle only accepts
//! with a session: a session-info request announces our public key, the vehicle answers
//! with its own key, an epoch, a counter and its clock, and every signed command after that
//! carries an HMAC over the command and that session state.
//!
//! Key agreement is left to the caller, who hands [`MessageSigner`] the derived HMAC key.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::message::status_request::{from_destination, to_destination};
use crate::message::{random_id, routable, Domain, Frame};
use crate::vin::Vin;
use crate::wire::{self, parse_fields, FieldValue, ParsedMessage};

/// Overall timeout for the session-info reply, which the vehicle trickles out slowly.
pub const SESSION_INFO_TIMEOUT: Duration = Duration::from_secs(30);
pub const SESSION_INFO_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a signed command stays valid, in vehicle seconds.
const EXPIRES_IN_SECS: i64 = 30;
const SIGNATURE_TYPE_HMAC_PERSONALIZED: u8 = 0x01;
const VEHICLE_SECURITY_TAG_LEN: usize = 16;

/// Uncompressed P-256 point: `0x04 || X || Y`.
pub type PublicKey = [u8; 65];

type HmacSha256 = Hmac<Sha256>;

/// `SessionInfo` fields.
mod field {
    pub const COUNTER: u32 = 1;
    pub const PUBLIC_KEY: u32 = 2;
    pub const EPOCH: u32 = 3;
    pub const CLOCK_TIME: u32 = 4;
    pub const STATUS: u32 = 5;
    pub const HANDLE: u32 = 6;

    /// `SessionInfoRequest.public_key`
    pub const REQUEST_PUBLIC_KEY: u32 = 1;

    /// `HMAC_Personalized_Signature_Data` fields.
    pub const SIG_EPOCH: u32 = 1;
    pub const SIG_COUNTER: u32 = 2;
    pub const SIG_EXPIRES_AT: u32 = 3;
    pub const SIG_TAG: u32 = 4;
}

/// What the vehicle reported about the session. Fields left at their protobuf default are
/// omitted on the wire and read back as zero or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub counter: u32,
    pub public_key: Vec<u8>,
    pub epoch: Vec<u8>,
    /// Vehicle clock, seconds since its epoch.
    pub clock_time: u32,
    pub status: u64,
    pub handle: u32,
}

impl SessionInfo {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

pub fn build_session_info_request(public_key: &PublicKey, routing_address: &[u8; 16]) -> Result<Frame> {
    build_session_info_request_with(public_key, routing_address, &random_id())
}

fn build_session_info_request_with(
    public_key: &PublicKey,
    routing_address: &[u8; 16],
    request_id: &[u8; 16],
) -> Result<Frame> {
    let request = wire::write_bytes_field(field::REQUEST_PUBLIC_KEY, public_key);

    let mut payload = to_destination(Domain::VehicleSecurity);
    payload.extend(from_destination(routing_address));
    payload.extend(wire::write_bytes_field(routable::SESSION_INFO_REQUEST, &request));
    payload.extend(wire::write_bytes_field(routable::UUID, request_id));
    Frame::from_payload(&payload)
}

/// Read field 15 of a `RoutableMessage` (without its length header).
pub fn parse_session_info(message: &[u8]) -> Result<SessionInfo> {
    let outer = parse_fields(message);
    let info = outer.bytes(routable::SESSION_INFO).ok_or_else(|| {
        Error::handshake(format!("response has no session info, fields present: {:?}", outer.field_numbers()))
    })?;

    let fields = parse_fields(info);
    let clock_time = match fields.get(field::CLOCK_TIME) {
        Some(FieldValue::Fixed32(bytes)) => u32::from_le_bytes(*bytes),
        _ => 0,
    };
    Ok(SessionInfo {
        counter: varint_u32(&fields, field::COUNTER, "counter")?,
        public_key: fields.bytes(field::PUBLIC_KEY).unwrap_or_default().to_vec(),
        epoch: fields.bytes(field::EPOCH).unwrap_or_default().to_vec(),
        clock_time,
        status: fields.varint(field::STATUS).unwrap_or(0),
        handle: varint_u32(&fields, field::HANDLE, "handle")?,
    })
}

/// A 32-bit session value, zero when absent.
fn varint_u32(fields: &ParsedMessage<'_>, number: u32, name: &str) -> Result<u32> {
    let value = fields.varint(number).unwrap_or(0);
    u32::try_from(value).map_err(|_| Error::handshake(format!("session {name} {value} does not fit 32 bits")))
}

fn unix_now() -> Result<i64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::handshake("system clock is before the unix epoch"))?;
    i64::try_from(now.as_secs()).map_err(|_| Error::handshake("system clock out of range"))
}

/// Signs commands for one session.
#[derive(Clone)]
pub struct MessageSigner {
    vin: Vin,
    epoch: Vec<u8>,
    counter: u32,
    /// Local clock minus vehicle clock, in seconds.
    clock_delta: i64,
    hmac_key: Vec<u8>,
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner")
            .field("vin", &self.vin)
            .field("epoch", &hex::encode(&self.epoch))
            .field("counter", &self.counter)
            .field("clock_delta", &self.clock_delta)
            .finish_non_exhaustive()
    }
}

impl MessageSigner {
    pub fn new(vin: Vin, epoch: Vec<u8>, counter: u32, clock_delta: i64, hmac_key: Vec<u8>) -> Self {
        Self { vin, epoch, counter, clock_delta, hmac_key }
    }

    /// Take epoch, counter and clock offset from a session-info reply received just now.
    pub fn from_session(vin: Vin, session: &SessionInfo, hmac_key: Vec<u8>) -> Result<Self> {
        let clock_delta = unix_now()? - i64::from(session.clock_time);
        Ok(Self::new(vin, session.epoch.clone(), session.counter, clock_delta, hmac_key))
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Wrap `command` in a signed, length-prefixed `RoutableMessage` for `domain`.
    ///
    /// Each call uses the next counter value, so a frame that is never delivered still
    /// burns its counter.
    pub fn sign_command(&mut self, command: &[u8], domain: Domain) -> Result<Frame> {
        self.sign_command_at(command, domain, unix_now()?)
    }

    fn sign_command_at(&mut self, command: &[u8], domain: Domain, now: i64) -> Result<Frame> {
        self.counter = self.counter.wrapping_add(1);
        let expires_at = u32::try_from(now - self.clock_delta + EXPIRES_IN_SECS)
            .map_err(|_| Error::handshake("command expiry does not fit the vehicle clock"))?;

        let mut metadata = vec![SIGNATURE_TYPE_HMAC_PERSONALIZED];
        metadata.extend(wire::write_varint(domain.wire_value()));
        metadata.extend_from_slice(self.vin.as_str().as_bytes());
        metadata.extend_from_slice(command);
        metadata.extend_from_slice(&self.epoch);
        metadata.extend(wire::write_varint(u64::from(self.counter)));
        metadata.extend_from_slice(&expires_at.to_le_bytes());

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .map_err(|_| Error::handshake("unusable HMAC key"))?;
        mac.update(&metadata);
        let mut tag = mac.finalize().into_bytes().to_vec();
        if domain == Domain::VehicleSecurity {
            tag.truncate(VEHICLE_SECURITY_TAG_LEN);
        }

        let mut signature = wire::write_bytes_field(field::SIG_EPOCH, &self.epoch);
        signature.extend(wire::write_varint_field(field::SIG_COUNTER, u64::from(self.counter)));
        signature.extend(wire::write_fixed32_field(field::SIG_EXPIRES_AT, expires_at));
        signature.extend(wire::write_bytes_field(field::SIG_TAG, &tag));

        let mut payload = to_destination(domain);
        payload.extend(wire::write_bytes_field(routable::PAYLOAD, command));
        payload.extend(wire::write_bytes_field(routable::SIGNATURE_DATA, &signature));
        Frame::from_payload(&payload)
    }
}
