//! Error types for the vehicle status client.
//!
//! Codec faults (`MalformedVarint`, `InvalidFieldNumber`, `UnsupportedWireType`,
//! `TruncatedField`) are produced by [`crate::wire`] but never escape a status query: the
//! response parser treats them as an absent field. Everything else propagates to the caller
//! unchanged, and a failed exchange never touches the accumulated [`crate::VehicleState`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the vehicle status client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid VIN {vin:?}: expected 17 characters, got {len}")]
    InvalidVin { vin: String, len: usize },

    #[error("connection failed: {reason}")]
    ConnectionFailure {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("not connected to vehicle")]
    NotConnected,

    #[error("no response received within {timeout:?}")]
    ResponseTimeout { timeout: Duration },

    #[error("malformed varint at offset {offset}")]
    MalformedVarint { offset: usize },

    #[error("field number 0 at offset {offset}")]
    InvalidFieldNumber { offset: usize },

    #[error("unsupported wire type {wire_type} at offset {offset}")]
    UnsupportedWireType { wire_type: u8, offset: usize },

    #[error("field at offset {offset} needs {needed} bytes, {available} available")]
    TruncatedField { offset: usize, needed: usize, available: usize },

    #[error("response has no protobuf payload field")]
    MissingPayloadField,

    #[error("response carries no vehicle status, fields present: {available:?}")]
    UnrecognizedResponseShape { available: Vec<u32> },

    #[error("failed to write chunk {chunk} of {total}")]
    TransportWrite {
        chunk: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("frame payload of {len} bytes does not fit a 2-byte length header")]
    FrameTooLarge { len: usize },

    #[error("config file error: {path}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid hex key: {0}")]
    InvalidHexKey(#[from] hex::FromHexError),

    #[error("session handshake failed: {reason}")]
    Handshake { reason: String },

    #[cfg(feature = "bluest")]
    #[error("bluetooth error: {0}")]
    Ble(#[from] bluest::Error),
}

impl Error {
    /// Whether repeating the exchange (possibly after a reconnect) can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailure { .. } => true,
            Error::NotConnected => true,
            Error::ResponseTimeout { .. } => true,
            Error::TransportWrite { .. } => true,
            #[cfg(feature = "bluest")]
            Error::Ble(_) => true,
            _ => false,
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Error::ConnectionFailure { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::ConnectionFailure { reason: reason.into(), source: Some(source.into()) }
    }

    pub(crate) fn handshake(reason: impl Into<String>) -> Self {
        Error::Handshake { reason: reason.into() }
    }
}
