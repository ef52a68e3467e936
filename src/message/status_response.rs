//! Parse a reassembled status response into a [`VehicleStatus`].
//!
//! The response is a `RoutableMessage` whose payload (field 10) is a `FromVCSECMessage`.
//! The vehicle status sub-message turns up in one of two shapes:
//!
//! - field 1, the documented `VehicleStatus` with a closure sub-message, lock state, sleep
//!   status and user presence as plain fields;
//! - field 3, where field 2 may hold a nested message wrapping an opaque closure blob that
//!   cannot be decoded. Closures stay unset in this shape.
//!
//! Decode faults below the two structural checks never fail the parse; the affected field
//! is simply treated as absent.

use tracing::debug;

use super::routable;
use crate::error::{Error, Result};
use crate::vehicle_state::{ClosureState, LockState, SleepStatus, UserPresence, VehicleStatus};
use crate::wire::{parse_fields, FieldValue, ParsedMessage};

/// `FromVCSECMessage` fields carrying the vehicle status.
const DIRECT_STATUS: u32 = 1;
const BLOB_STATUS: u32 = 3;

/// `VehicleStatus` fields.
const CLOSURES: u32 = 1;
const LOCK_STATE: u32 = 2;
const SLEEP_STATUS: u32 = 3;
const USER_PRESENCE: u32 = 4;
/// Undocumented inverted lock flag, consulted only when `LOCK_STATE` is absent.
const LOCK_FLAG: u32 = 7;

/// Lock state inside the nested blob-shape message.
const BLOB_LOCK_STATE: u32 = 3;

pub fn parse_status_response(response: &[u8]) -> Result<VehicleStatus> {
    let outer = parse_fields(response);
    let payload = outer.bytes(routable::PAYLOAD).ok_or(Error::MissingPayloadField)?;

    let inner = parse_fields(payload);
    if let Some(status) = inner.bytes(DIRECT_STATUS) {
        debug!(len = status.len(), "vehicle status in direct shape");
        Ok(parse_direct(&parse_fields(status)))
    } else if let Some(status) = inner.bytes(BLOB_STATUS) {
        debug!(len = status.len(), "vehicle status in blob shape");
        Ok(parse_blob(&parse_fields(status)))
    } else {
        Err(Error::UnrecognizedResponseShape { available: inner.field_numbers() })
    }
}

fn parse_direct(fields: &ParsedMessage<'_>) -> VehicleStatus {
    // Closures at their default value are omitted on the wire, and for this vehicle the
    // omitted value means closed.
    let closed = Some(ClosureState::Closed);
    let mut status = VehicleStatus {
        front_driver_door: closed,
        front_passenger_door: closed,
        rear_driver_door: closed,
        rear_passenger_door: closed,
        front_trunk: closed,
        rear_trunk: closed,
        charge_port: closed,
        tonneau: closed,
        ..Default::default()
    };

    if let Some(closures) = fields.bytes(CLOSURES) {
        let closures = parse_fields(closures);
        let slots = [
            (1, &mut status.front_driver_door),
            (2, &mut status.front_passenger_door),
            (3, &mut status.rear_driver_door),
            (4, &mut status.rear_passenger_door),
            (5, &mut status.rear_trunk),
            (6, &mut status.front_trunk),
            (7, &mut status.charge_port),
            (8, &mut status.tonneau),
        ];
        for (number, slot) in slots {
            if let Some(value) = closures.get(number) {
                *slot = Some(closure_state(value));
            }
        }
    }

    if fields.contains(LOCK_STATE) {
        status.lock_state = fields.varint(LOCK_STATE).and_then(LockState::from_wire);
    } else {
        status.lock_state = fields.varint(LOCK_FLAG).and_then(LockState::from_inverted_flag);
    }

    status.sleep_status = fields.varint(SLEEP_STATUS).map(SleepStatus::from_wire);
    status.user_presence = fields.varint(USER_PRESENCE).map(UserPresence::from_wire);
    status
}

fn parse_blob(fields: &ParsedMessage<'_>) -> VehicleStatus {
    let mut status = VehicleStatus::default();

    match fields.get(LOCK_STATE) {
        Some(FieldValue::Varint(value)) => status.lock_state = LockState::from_wire(*value),
        Some(FieldValue::Bytes(nested)) => {
            // nested field 1 is the opaque closure blob
            status.lock_state = parse_fields(nested).varint(BLOB_LOCK_STATE).and_then(LockState::from_wire);
        }
        _ => {}
    }

    status.sleep_status = fields.varint(SLEEP_STATUS).map(SleepStatus::from_wire);
    status.user_presence = match fields.get(USER_PRESENCE) {
        Some(FieldValue::Varint(value)) => Some(UserPresence::from_wire(*value)),
        Some(FieldValue::Bytes([value])) => Some(UserPresence::from_wire(u64::from(*value))),
        _ => None,
    };
    status
}

/// A closure field that is present but not a varint still tells us the closure exists.
fn closure_state(value: &FieldValue<'_>) -> ClosureState {
    match value {
        FieldValue::Varint(value) => ClosureState::from_wire(*value),
        _ => ClosureState::Unknown,
    }
}
