//! Connect to a vehicle and query its status.
//!
//! One exchange at a time: each call takes `&mut self`, so requests against one client are
//! serialized and the accumulated state has a single writer.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::fragment::{drain_notifications, receive_length_prefixed, receive_message, send_fragmented};
use crate::message::status_request::build_status_request;
use crate::message::status_response::parse_status_response;
use crate::message::{random_id, Domain};
use crate::session::{
    build_session_info_request, parse_session_info, MessageSigner, PublicKey, SessionInfo, SESSION_INFO_IDLE_TIMEOUT,
    SESSION_INFO_TIMEOUT,
};
use crate::transport::{
    Characteristic, Connection, Transport, READ_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
};
use crate::validator::validate_response;
use crate::vehicle_state::{ChangeSet, VehicleState, VehicleStatus};
use crate::vin::Vin;

/// Time given to the BLE stack to finish tearing down a link.
const DISCONNECT_SETTLE: Duration = Duration::from_millis(100);

type CharacteristicOf<T> = <<T as Transport>::Connection as Connection>::Characteristic;

/// How [`VehicleClient::connect`] finds the vehicle.
#[derive(Debug, Clone)]
pub struct ConnectOptions<A> {
    /// Ignore a cached address and scan.
    pub force_scan: bool,
    /// Connect here directly, skipping the cache and the scan.
    pub address: Option<A>,
}

impl<A> Default for ConnectOptions<A> {
    fn default() -> Self {
        Self { force_scan: false, address: None }
    }
}

impl<A> ConnectOptions<A> {
    pub fn force_scan() -> Self {
        Self { force_scan: true, address: None }
    }

    pub fn address(address: A) -> Self {
        Self { force_scan: false, address: Some(address) }
    }
}

/// Result of one status exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// The accumulated status after merging the response.
    pub status: VehicleStatus,
    pub changes: ChangeSet,
}

struct Link<T: Transport> {
    connection: T::Connection,
    write: CharacteristicOf<T>,
    read: CharacteristicOf<T>,
}

struct CachedAddress<A> {
    address: A,
    found_at: Instant,
}

pub struct VehicleClient<T: Transport> {
    transport: T,
    config: ClientConfig,
    vin: Vin,
    ble_name: String,
    link: Option<Link<T>>,
    cached: Option<CachedAddress<T::Address>>,
    state: VehicleState,
}

impl<T: Transport> VehicleClient<T> {
    /// Fails only if the configured VIN is invalid. Nothing is scanned or connected yet.
    pub fn new(transport: T, config: ClientConfig) -> Result<Self> {
        let vin = config.vin()?;
        let ble_name = vin.ble_name();
        debug!(%vin, %ble_name, "created vehicle client");
        Ok(Self { transport, config, vin, ble_name, link: None, cached: None, state: VehicleState::new() })
    }

    pub fn vin(&self) -> &Vin {
        &self.vin
    }

    /// The name the vehicle advertises.
    pub fn ble_name(&self) -> &str {
        &self.ble_name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    /// The last scanned address, while it is still fresh enough to reuse.
    pub fn cached_address(&self) -> Option<&T::Address> {
        self.cached
            .as_ref()
            .filter(|cached| cached.found_at.elapsed() < self.config.device_cache_timeout())
            .map(|cached| &cached.address)
    }

    pub async fn connect(&mut self, options: ConnectOptions<T::Address>) -> Result<()> {
        if self.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        let connection = match (options.address, self.cached_address().cloned()) {
            (Some(address), _) => {
                debug!(?address, "connecting to given address");
                self.transport.connect(&address, self.config.connection_timeout()).await?
            }
            (None, Some(address)) if !options.force_scan => {
                debug!(?address, "connecting to cached address");
                match self.transport.connect(&address, self.config.connection_timeout()).await {
                    Ok(connection) => connection,
                    Err(err) => {
                        warn!(?address, error = %err, "cached address failed, scanning again");
                        self.cached = None;
                        self.scan_and_connect().await?
                    }
                }
            }
            _ => self.scan_and_connect().await?,
        };

        let link = Self::open_link(connection, self.config.mtu).await?;
        self.link = Some(link);
        if !self.config.retain_state_across_reconnects {
            self.state = VehicleState::new();
        }
        info!(name = %self.ble_name, "connected to vehicle");
        Ok(())
    }

    async fn scan_and_connect(&mut self) -> Result<T::Connection> {
        debug!(name = %self.ble_name, timeout = ?self.config.scan_timeout(), "scanning");
        let address = self
            .transport
            .scan(&self.ble_name, self.config.scan_timeout())
            .await?
            .ok_or_else(|| Error::connection_failed(format!("vehicle {} not found", self.ble_name)))?;
        debug!(?address, "found vehicle");
        self.cached = Some(CachedAddress { address: address.clone(), found_at: Instant::now() });
        self.transport.connect(&address, self.config.connection_timeout()).await
    }

    /// Set up characteristics on a fresh connection, closing it again if that fails.
    async fn open_link(mut connection: T::Connection, mtu: u16) -> Result<Link<T>> {
        match connection.negotiate_mtu(mtu).await {
            Ok(actual) => debug!(mtu = actual, "negotiated MTU"),
            Err(err) => warn!(error = %err, "MTU negotiation failed, continuing with default"),
        }

        match Self::open_characteristics(&mut connection).await {
            Ok((write, read)) => Ok(Link { connection, write, read }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "closing after failed setup");
                }
                Err(err)
            }
        }
    }

    async fn open_characteristics(
        connection: &mut T::Connection,
    ) -> Result<(CharacteristicOf<T>, CharacteristicOf<T>)> {
        let write = connection.open_characteristic(SERVICE_UUID, WRITE_CHARACTERISTIC_UUID).await?;
        let mut read = connection.open_characteristic(SERVICE_UUID, READ_CHARACTERISTIC_UUID).await?;
        read.subscribe(true).await?;
        Ok((write, read))
    }

    /// Close the link. Teardown errors are logged, never returned. The address cache and
    /// the accumulated state survive.
    pub async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        if let Err(err) = link.read.subscribe(false).await {
            debug!(error = %err, "unsubscribe failed");
        }
        if let Err(err) = link.connection.close().await {
            warn!(error = %err, "disconnect failed");
        }
        sleep(DISCONNECT_SETTLE).await;
        info!(name = %self.ble_name, "disconnected from vehicle");
    }

    /// Ask the vehicle for its status and merge the answer into [`Self::state`].
    ///
    /// Notifications left over from an earlier exchange are discarded first. On any error
    /// the accumulated state is left as it was.
    pub async fn send_status_request(&mut self) -> Result<StatusUpdate> {
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;

        let frame = build_status_request()?;
        debug!(len = frame.len(), "sending status request");
        drain_notifications(&mut link.read).await?;
        send_fragmented(&mut link.write, frame.as_bytes(), self.config.chunk_size, self.config.chunk_pacing()).await?;
        let response =
            receive_message(&mut link.read, self.config.response_timeout(), self.config.idle_timeout()).await?;

        let report = validate_response(&response);
        if report.is_valid() {
            debug!(len = response.len(), "response matches the known layout");
        } else {
            let mismatches: Vec<String> = report.mismatches.iter().map(ToString::to_string).collect();
            warn!(len = response.len(), mismatches = %mismatches.join("; "), "unexpected response layout");
        }

        let snapshot = parse_status_response(&response)?;
        let changes = self.state.merge(&snapshot);
        for change in &changes {
            info!(%change, "vehicle state changed");
        }
        Ok(StatusUpdate { status: self.state.snapshot(), changes })
    }

    /// Announce `public_key` and return the vehicle's session parameters.
    pub async fn request_session_info(&mut self, public_key: &PublicKey) -> Result<SessionInfo> {
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;

        let frame = build_session_info_request(public_key, &random_id())?;
        debug!(len = frame.len(), "sending session info request");
        drain_notifications(&mut link.read).await?;
        send_fragmented(&mut link.write, frame.as_bytes(), self.config.chunk_size, self.config.chunk_pacing()).await?;
        let response = receive_length_prefixed(&mut link.read, SESSION_INFO_TIMEOUT, SESSION_INFO_IDLE_TIMEOUT).await?;

        let session = parse_session_info(&response)?;
        if !session.is_ok() {
            warn!(status = session.status, "vehicle reported a session error");
        }
        debug!(counter = session.counter, clock_time = session.clock_time, "session info received");
        Ok(session)
    }

    /// Sign `command` for `domain`, send it and return the raw reassembled response.
    pub async fn send_signed_command(
        &mut self,
        signer: &mut MessageSigner,
        domain: Domain,
        command: &[u8],
    ) -> Result<Vec<u8>> {
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;

        let frame = signer.sign_command(command, domain)?;
        debug!(len = frame.len(), counter = signer.counter(), ?domain, "sending signed command");
        drain_notifications(&mut link.read).await?;
        send_fragmented(&mut link.write, frame.as_bytes(), self.config.chunk_size, self.config.chunk_pacing()).await?;
        receive_message(&mut link.read, self.config.response_timeout(), self.config.idle_timeout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::vehicle_state::{ClosureState, LockState, StatusField};
    use crate::wire::{write_bytes_field, write_fixed32_field, write_varint_field};

    const VIN: &str = "7G2CEHED7RA003723";
    const NAME: &str = "S3e4320fbef5e5519C";
    const RECORDED: &str = "32121210e896e872cde518581d77c3d96897bb023a020802520c0a0a0a024003100118022001";

    fn client(transport: &MockTransport) -> VehicleClient<MockTransport> {
        VehicleClient::new(transport.clone(), ClientConfig::new(VIN)).unwrap()
    }

    fn advertised() -> MockTransport {
        let transport = MockTransport::new();
        transport.advertise(NAME, "AA:BB");
        transport
    }

    /// The recorded response as the notifications deliver it, without the leading tag.
    fn recorded_notifications(transport: &MockTransport) {
        transport.notify_chunked(&hex::decode(RECORDED).unwrap()[1..], 20);
    }

    #[test]
    fn test_invalid_vin() {
        let result = VehicleClient::new(MockTransport::new(), ClientConfig::new("SHORT"));
        assert!(matches!(result, Err(Error::InvalidVin { len: 5, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_scans_then_reuses_cache() {
        let transport = advertised();
        let mut client = client(&transport);
        assert_eq!(client.ble_name(), NAME);

        client.connect(ConnectOptions::default()).await.unwrap();
        assert!(client.is_connected());
        assert!(transport.is_subscribed());
        assert_eq!(transport.scans(), 1);

        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(!transport.is_subscribed());
        assert_eq!(transport.closes(), 1);
        assert_eq!(client.cached_address().map(String::as_str), Some("AA:BB"));

        client.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(transport.scans(), 1);
        assert_eq!(transport.connects(), vec!["AA:BB", "AA:BB"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cache_scans_again() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        client.disconnect().await;

        tokio::time::advance(Duration::from_millis(300_000)).await;
        assert!(client.cached_address().is_none());
        client.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(transport.scans(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cached_address_rescans_once() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        client.disconnect().await;

        transport.set_unreachable("AA:BB");
        let err = client.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailure { .. }));
        assert_eq!(transport.scans(), 2);
        assert_eq!(transport.connects().len(), 3);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_scan_and_explicit_address() {
        let transport = advertised();
        let mut client = client(&transport);

        client.connect(ConnectOptions::address("11:22".to_owned())).await.unwrap();
        assert_eq!(transport.scans(), 0);
        assert_eq!(transport.connects(), vec!["11:22"]);
        client.disconnect().await;

        client.connect(ConnectOptions::force_scan()).await.unwrap();
        client.disconnect().await;
        client.connect(ConnectOptions::force_scan()).await.unwrap();
        assert_eq!(transport.scans(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vehicle_not_found() {
        let transport = MockTransport::new();
        let mut client = client(&transport);
        let err = client.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailure { .. }));
        assert!(err.is_retryable());
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_request_requires_connection() {
        let mut client = client(&advertised());
        assert!(matches!(client.send_status_request().await, Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_request_merges_response() {
        let transport = advertised();
        transport.set_mtu(Some(517));
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();

        recorded_notifications(&transport);
        let update = client.send_status_request().await.unwrap();

        let written = transport.written_bytes();
        assert_eq!(written.len(), 52);
        assert_eq!(&written[..6], hex::decode("003232020802").unwrap().as_slice());
        assert_eq!(transport.writes().len(), 3);

        assert_eq!(update.status.lock_state, Some(LockState::Locked));
        assert_eq!(update.status.tonneau, Some(ClosureState::Ajar));
        assert_eq!(update.changes.len(), 11);
        assert_eq!(client.state().is_locked(), Some(true));
        assert_eq!(client.state().all_doors_closed(), Some(true));

        recorded_notifications(&transport);
        let update = client.send_status_request().await.unwrap();
        assert!(update.changes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_exchange_leaves_state_alone() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        recorded_notifications(&transport);
        client.send_status_request().await.unwrap();
        let before = client.state().clone();

        let err = client.send_status_request().await.unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout { .. }));
        assert_eq!(client.state(), &before);

        // a response without a payload field fails the parse, also without touching state
        transport.notify(&hex::decode("121210000000000000000000000000000000003a020802").unwrap());
        let err = client.send_status_request().await.unwrap_err();
        assert!(matches!(err, Error::MissingPayloadField));
        assert_eq!(client.state(), &before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_aborts_exchange() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        transport.fail_write_at(0);
        recorded_notifications(&transport);

        let err = client.send_status_request().await.unwrap_err();
        assert!(matches!(err, Error::TransportWrite { chunk: 1, total: 3, .. }));
        assert!(transport.writes().is_empty());
        assert!(client.state().status().lock_state.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_reset_on_reconnect_unless_retained() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        recorded_notifications(&transport);
        client.send_status_request().await.unwrap();

        client.disconnect().await;
        assert_eq!(client.state().is_locked(), Some(true));
        client.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(client.state(), &VehicleState::new());

        let mut config = ClientConfig::new(VIN);
        config.retain_state_across_reconnects = true;
        let mut client = VehicleClient::new(transport.clone(), config).unwrap();
        client.connect(ConnectOptions::default()).await.unwrap();
        recorded_notifications(&transport);
        client.send_status_request().await.unwrap();
        client.disconnect().await;
        client.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(client.state().is_locked(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_response_keeps_earlier_fields() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        recorded_notifications(&transport);
        client.send_status_request().await.unwrap();

        // blob shape reporting only an unlocked car
        let status = write_varint_field(2, 0);
        let inner = write_bytes_field(3, &status);
        let mut response = hex::decode("121210").unwrap();
        response.extend([0xab; 16]);
        response.extend(hex::decode("3a020802").unwrap());
        response.extend(write_bytes_field(10, &inner));
        transport.notify(&response);

        let update = client.send_status_request().await.unwrap();
        assert_eq!(update.changes.len(), 1);
        let change = update.changes.get(StatusField::LockState).unwrap();
        assert_eq!(change.to_string(), "lock_state: LOCKED -> UNLOCKED");
        assert_eq!(update.status.tonneau, Some(ClosureState::Ajar));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_session_info() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();

        let mut info = write_varint_field(1, 3);
        info.extend(write_bytes_field(3, &[0xe0; 16]));
        info.extend(write_fixed32_field(4, 5000));
        let payload = write_bytes_field(15, &info);
        let mut reply = (payload.len() as u16).to_be_bytes().to_vec();
        reply.extend(&payload);
        transport.notify_chunked(&reply, 20);

        let mut key = [0u8; 65];
        key[0] = 0x04;
        let session = client.request_session_info(&key).await.unwrap();
        assert_eq!(session.counter, 3);
        assert_eq!(session.clock_time, 5000);
        assert_eq!(transport.written_bytes().len(), 2 + 112);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_signed_command() {
        let transport = advertised();
        let mut client = client(&transport);
        client.connect(ConnectOptions::default()).await.unwrap();
        transport.notify(&hex::decode("1202080352020a00").unwrap());

        let mut signer = MessageSigner::new(Vin::new(VIN).unwrap(), vec![0xe0; 16], 0, 0, vec![0x33; 32]);
        let response = client.send_signed_command(&mut signer, Domain::Infotainment, &[0x0a, 0x00]).await.unwrap();
        assert_eq!(response, hex::decode("321202080352020a00").unwrap());
        assert_eq!(signer.counter(), 1);
        assert_eq!(&transport.written_bytes()[2..6], hex::decode("32020803").unwrap().as_slice());
    }
}
