use std::fmt;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// A 17-character vehicle identification number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Vin(String);

impl Vin {
    pub const LEN: usize = 17;

    pub fn new(vin: &str) -> Result<Self> {
        let len = vin.chars().count();
        if len != Self::LEN || !vin.is_ascii() {
            return Err(Error::InvalidVin { vin: vin.to_owned(), len });
        }
        Ok(Vin(vin.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name the vehicle advertises over BLE: `S` + the first 8 bytes of the VIN's SHA-1
    /// in lowercase hex + `C`.
    pub fn ble_name(&self) -> String {
        let digest = Sha1::digest(self.0.as_bytes());
        format!("S{}C", hex::encode(&digest[..8]))
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
