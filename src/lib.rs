//! Read door, lock and sleep status from a vehicle over Bluetooth Low Energy, without pairing
//! a key or establishing a session.
//!
//! The vehicle answers one request unauthenticated: a status query addressed to its security
//! controller. This crate builds that request, splits it into BLE-sized writes, reassembles
//! the notification fragments that come back, and decodes them with a small protobuf reader
//! that only knows the fields the vehicle actually sends.
//!
//! Responses are often partial. [`VehicleState`] folds each one into the last known state so
//! a field the vehicle did not mention keeps its previous value, and reports what changed.
//!
//! Currently the following can be read:
//!
//! - Doors, trunks, charge port and tonneau (open, closed, ajar, ...)
//! - Lock state
//! - Sleep status
//! - User presence
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # #[cfg(feature = "bluest")]
//! # #[tokio::main]
//! # pub async fn main() {
//!     use carread::{ClientConfig, ConnectOptions, VehicleClient};
//!     use carread::transport::bluest::BluestTransport;
//!
//!     let transport = BluestTransport::new().await.unwrap();
//!     let mut client = VehicleClient::new(transport, ClientConfig::new("7G2CEHED7RA003723")).unwrap();
//!     client.connect(ConnectOptions::default()).await.unwrap();
//!     loop {
//!         let update = client.send_status_request().await.unwrap();
//!         println!("{}", update.status);
//!         tokio::time::sleep(Duration::from_secs(5)).await;
//!     }
//! # }
//! # #[cfg(not(feature = "bluest"))]
//! # fn main() {}
//! ```

pub mod config;
pub mod error;
pub mod fragment;
pub mod message;
pub mod session;
pub mod transport;
pub mod validator;
mod vehicle_client;
pub mod vehicle_state;
mod vin;
pub mod wire;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use message::status_request::build_status_request;
pub use message::status_response::parse_status_response;
pub use message::{Domain, Frame};
pub use session::{MessageSigner, SessionInfo};
pub use validator::{validate_response, ValidationReport};
pub use vehicle_client::{ConnectOptions, StatusUpdate, VehicleClient};
pub use vehicle_state::{
    ChangeSet, ClosureState, FieldChange, LockState, SleepStatus, StatusField, StatusValue, UserPresence,
    VehicleState, VehicleStatus,
};
pub use vin::Vin;
