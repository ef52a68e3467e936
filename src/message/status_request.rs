//! The unauthenticated vehicle-status request.
//!
//! The layout below is what the vehicle accepts, byte for byte:
//!
//! Bytes           | Field
//! `32 02 08 02`   | 6: to destination, domain = vehicle security
//! `3a 12 12 10 ..`| 7: from destination, 16-byte routing address
//! `9a 03 10 ..`   | 51: request uuid, 16 bytes (a 2-byte uuid is silently ignored)
//! `a0 03 02`      | 52: flags = 2
//! `52 02 0a 00`   | 10: payload, an empty signature-data sub-message
//!
//! No key material is included, which is what lets the request through without a session.

use super::{random_id, routable, Domain, Frame};
use crate::error::Result;
use crate::wire;

const FLAGS: u64 = 2;

/// Encoded `Destination { domain }`.
pub(crate) fn to_destination(domain: Domain) -> Vec<u8> {
    let destination = wire::write_varint_field(routable::DESTINATION_DOMAIN, domain.wire_value());
    wire::write_bytes_field(routable::TO_DESTINATION, &destination)
}

/// Encoded `Destination { routing_address }`.
pub(crate) fn from_destination(routing_address: &[u8; 16]) -> Vec<u8> {
    let destination = wire::write_bytes_field(routable::DESTINATION_ROUTING_ADDRESS, routing_address);
    wire::write_bytes_field(routable::FROM_DESTINATION, &destination)
}

/// Build a status request with a fresh routing address and request id.
pub fn build_status_request() -> Result<Frame> {
    build_status_request_with(&random_id(), &random_id())
}

pub(crate) fn build_status_request_with(routing_address: &[u8; 16], request_id: &[u8; 16]) -> Result<Frame> {
    let mut payload = to_destination(Domain::VehicleSecurity);
    payload.extend(from_destination(routing_address));
    payload.extend(wire::write_bytes_field(routable::UUID, request_id));
    payload.extend(wire::write_varint_field(routable::FLAGS, FLAGS));
    payload.extend(wire::write_bytes_field(routable::PAYLOAD, &wire::write_bytes_field(1, &[])));
    Frame::from_payload(&payload)
}
