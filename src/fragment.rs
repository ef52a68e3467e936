//! Splitting requests into transport-sized writes, and reassembling notification fragments
//! into a response.
//!
//! Responses have no reliable length header, so completion is a heuristic: enough bytes with
//! a payload tag near the start, a hard size ceiling, or the vehicle going quiet after it has
//! sent something. The heuristic can fire early on a payload that happens to contain the tag
//! byte; callers get whatever was collected and the parser copes with a short message.
//!
//! The session-info reply is the exception. It does carry a 2-byte length header and is
//! collected with [`receive_length_prefixed`].

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::Characteristic;

/// Notification the vehicle sends in place of data when it has nothing for us.
pub const ERROR_SENTINEL: [u8; 3] = [0x22, 0x01, 0x01];

/// Leading tag of the outer message, which never makes it into the first notification.
pub const OMITTED_TAG: u8 = 0x32;

pub const DEFAULT_CHUNK_SIZE: usize = 20;
pub const DEFAULT_PACING: Duration = Duration::from_millis(50);

const MIN_COMPLETE_LEN: usize = 30;
/// How far into the buffer to look for the payload tag.
const MARKER_WINDOW: usize = 50;
const PAYLOAD_MARKER: u8 = 0x52;
const MAX_RESPONSE_LEN: usize = 100;

/// Upper bound on a plausible length header.
const MAX_LENGTH_PREFIXED: usize = 1024;

/// Most notifications discarded in one [`drain_notifications`] call.
const MAX_STALE_NOTIFICATIONS: usize = 64;

/// Write `frame` in `chunk_size` pieces, pausing `pacing` after each one.
///
/// A failed write aborts the rest. Chunks already written are not retried, so the whole
/// frame has to be sent again.
pub async fn send_fragmented<C>(characteristic: &mut C, frame: &[u8], chunk_size: usize, pacing: Duration) -> Result<()>
where
    C: Characteristic + ?Sized,
{
    let chunks: Vec<&[u8]> = frame.chunks(chunk_size.max(1)).collect();
    let total = chunks.len();
    trace!(len = frame.len(), total, tx = %hex::encode(frame), "sending frame");

    for (index, chunk) in chunks.into_iter().enumerate() {
        characteristic.write(chunk, true).await.map_err(|source| Error::TransportWrite {
            chunk: index + 1,
            total,
            source: Box::new(source),
        })?;
        sleep(pacing).await;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The packet was the error sentinel and was dropped.
    Skipped,
    Incomplete,
    Complete,
}

/// Accumulates response notifications.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    packets: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &[u8]) -> Progress {
        if packet == ERROR_SENTINEL {
            return Progress::Skipped;
        }

        // Some stacks leave the request's length header on the first notification.
        let data = match packet {
            [0x00, _, _, rest @ ..] if self.packets == 0 => rest,
            _ => packet,
        };
        self.packets += 1;
        self.buffer.extend_from_slice(data);

        if self.is_complete() {
            Progress::Complete
        } else {
            Progress::Incomplete
        }
    }

    fn is_complete(&self) -> bool {
        let len = self.buffer.len();
        let has_marker = self.buffer.iter().take(MARKER_WINDOW).any(|&byte| byte == PAYLOAD_MARKER);
        (len >= MIN_COMPLETE_LEN && has_marker) || len >= MAX_RESPONSE_LEN
    }

    pub fn has_packets(&self) -> bool {
        self.packets > 0
    }

    /// Bytes collected so far, without the omitted tag.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// The reassembled message with its leading tag restored.
    pub fn finish(self) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.buffer.len() + 1);
        message.push(OMITTED_TAG);
        message.extend(self.buffer);
        message
    }
}

/// Discard notifications that are already queued, returning how many were dropped.
///
/// Run before each request. A response cut short by the completion heuristic leaves its
/// tail queued, and that tail must not become the start of the next response.
pub async fn drain_notifications<C>(characteristic: &mut C) -> Result<usize>
where
    C: Characteristic + ?Sized,
{
    let mut dropped = 0;
    while dropped < MAX_STALE_NOTIFICATIONS {
        match characteristic.next_notification(Duration::ZERO).await? {
            Some(packet) => {
                trace!(len = packet.len(), rx = %hex::encode(&packet), "stale notification");
                dropped += 1;
            }
            None => break,
        }
    }
    if dropped > 0 {
        debug!(dropped, "discarded stale notifications");
    }
    Ok(dropped)
}

/// Collect one response.
///
/// Fails with [`Error::ResponseTimeout`] only when nothing but sentinels arrived within
/// `timeout`. Once something has arrived, `idle_timeout` of silence (or the overall deadline)
/// ends the message normally.
pub async fn receive_message<C>(characteristic: &mut C, timeout: Duration, idle_timeout: Duration) -> Result<Vec<u8>>
where
    C: Characteristic + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut reassembler = Reassembler::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            if reassembler.has_packets() {
                debug!(len = reassembler.buffered().len(), "response deadline reached, using what arrived");
                break;
            }
            debug!(?timeout, "no response");
            return Err(Error::ResponseTimeout { timeout });
        }

        let remaining = deadline - now;
        let wait = if reassembler.has_packets() { remaining.min(idle_timeout) } else { remaining };

        match characteristic.next_notification(wait).await? {
            Some(packet) => {
                trace!(len = packet.len(), rx = %hex::encode(&packet), "notification");
                match reassembler.push(&packet) {
                    Progress::Skipped => debug!("skipping error sentinel"),
                    Progress::Incomplete => {}
                    Progress::Complete => {
                        debug!(len = reassembler.buffered().len(), "response complete");
                        break;
                    }
                }
            }
            None if reassembler.has_packets() => {
                debug!(len = reassembler.buffered().len(), "vehicle went quiet, treating response as complete");
                break;
            }
            None => {}
        }
    }

    let message = reassembler.finish();
    trace!(rx = %hex::encode(&message), "reassembled response");
    Ok(message)
}

/// Collect a response that starts with a 2-byte big-endian length header and return the
/// message without the header.
pub async fn receive_length_prefixed<C>(
    characteristic: &mut C,
    timeout: Duration,
    idle_timeout: Duration,
) -> Result<Vec<u8>>
where
    C: Characteristic + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut packets: Vec<Vec<u8>> = Vec::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        let wait = if packets.is_empty() { remaining } else { remaining.min(idle_timeout) };

        match characteristic.next_notification(wait).await? {
            Some(packet) if packet.is_empty() || packet == ERROR_SENTINEL => {}
            Some(packet) => {
                trace!(len = packet.len(), rx = %hex::encode(&packet), "notification");
                packets.push(packet);
                if let Some(message) = find_length_prefixed(&packets) {
                    return Ok(message);
                }
            }
            None if !packets.is_empty() => break,
            None => {}
        }
    }

    if packets.is_empty() {
        return Err(Error::ResponseTimeout { timeout });
    }
    find_length_prefixed(&packets).ok_or_else(|| {
        let received: usize = packets.iter().map(Vec::len).sum();
        Error::handshake(format!("incomplete length-prefixed response after {received} bytes"))
    })
}

/// Find the first packet that opens a plausible length header and return the message it
/// announces, if everything from that packet on holds enough bytes.
pub fn find_length_prefixed(packets: &[Vec<u8>]) -> Option<Vec<u8>> {
    for (start, packet) in packets.iter().enumerate() {
        let expected = match packet.as_slice() {
            [0x00, low, ..] => usize::from(u16::from_be_bytes([0x00, *low])),
            _ => continue,
        };
        if expected == 0 || expected > MAX_LENGTH_PREFIXED {
            continue;
        }

        let buffer: Vec<u8> = packets[start..].concat();
        if buffer.len() >= expected + 2 {
            return Some(buffer[2..expected + 2].to_vec());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockCharacteristic, MockTransport};
    use crate::transport::{Connection, Transport, READ_CHARACTERISTIC_UUID, SERVICE_UUID};

    const RECORDED: &str = "32121210e896e872cde518581d77c3d96897bb023a020802520c0a0a0a024003100118022001";

    async fn characteristic(transport: &MockTransport) -> MockCharacteristic {
        let mut connection = transport.connect(&"mock".to_owned(), Duration::from_secs(1)).await.unwrap();
        connection.open_characteristic(SERVICE_UUID, READ_CHARACTERISTIC_UUID).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fragmented_chunks_and_paces() {
        let transport = MockTransport::new();
        let mut ch = characteristic(&transport).await;
        let frame: Vec<u8> = (0..52).collect();

        let start = Instant::now();
        send_fragmented(&mut ch, &frame, DEFAULT_CHUNK_SIZE, DEFAULT_PACING).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(150));

        let writes = transport.writes();
        let sizes: Vec<usize> = writes.iter().map(|w| w.bytes.len()).collect();
        assert_eq!(sizes, vec![20, 20, 12]);
        assert!(writes.iter().all(|w| w.require_ack));
        assert_eq!(transport.written_bytes(), frame);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fragmented_aborts_on_failed_chunk() {
        let transport = MockTransport::new();
        transport.fail_write_at(1);
        let mut ch = characteristic(&transport).await;

        let err = send_fragmented(&mut ch, &[0u8; 52], 20, DEFAULT_PACING).await.unwrap_err();
        assert!(matches!(err, Error::TransportWrite { chunk: 2, total: 3, .. }));
        assert_eq!(transport.writes().len(), 1);
    }

    #[test]
    fn test_strips_length_header_from_first_packet() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(&hex::decode("000028").unwrap()), Progress::Incomplete);
        reassembler.push(&hex::decode("121210aabb").unwrap());
        assert_eq!(reassembler.finish(), hex::decode("32121210aabb").unwrap());
    }

    #[test]
    fn test_only_first_packet_is_stripped() {
        let mut reassembler = Reassembler::new();
        reassembler.push(&hex::decode("1212").unwrap());
        reassembler.push(&hex::decode("000102").unwrap());
        assert_eq!(reassembler.finish(), hex::decode("321212000102").unwrap());
    }

    #[test]
    fn test_sentinels_are_dropped() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(&ERROR_SENTINEL), Progress::Skipped);
        assert!(!reassembler.has_packets());
        // the first real packet is still treated as the first
        reassembler.push(&hex::decode("000028121210").unwrap());
        assert_eq!(reassembler.push(&ERROR_SENTINEL), Progress::Skipped);
        reassembler.push(&hex::decode("aa").unwrap());
        assert_eq!(reassembler.finish(), hex::decode("32121210aa").unwrap());
    }

    #[test]
    fn test_completion_heuristic() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(&[0x01; 29]), Progress::Incomplete);
        assert_eq!(reassembler.push(&[0x52]), Progress::Complete);

        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(&[0x01; 60]), Progress::Incomplete);
        assert_eq!(reassembler.push(&[0x52; 39]), Progress::Incomplete);
        assert_eq!(reassembler.push(&[0x01]), Progress::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_recorded_response_in_chunks() {
        let recorded = hex::decode(RECORDED).unwrap();
        let transport = MockTransport::new();
        transport.notify_chunked(&recorded[1..], 20).deliver();
        let mut ch = characteristic(&transport).await;

        let message = receive_message(&mut ch, Duration::from_millis(5000), Duration::from_millis(1000)).await.unwrap();
        assert_eq!(message, recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_without_packets() {
        let transport = MockTransport::new();
        transport.notify(&ERROR_SENTINEL).deliver();
        let mut ch = characteristic(&transport).await;

        let start = Instant::now();
        let err = receive_message(&mut ch, Duration::from_millis(5000), Duration::from_millis(1000)).await.unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout { timeout } if timeout == Duration::from_millis(5000)));
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_completes_when_vehicle_goes_quiet() {
        let transport = MockTransport::new();
        transport.silence(Duration::from_millis(300)).notify(&hex::decode("121210aabbcc").unwrap()).deliver();
        let mut ch = characteristic(&transport).await;

        let start = Instant::now();
        let message = receive_message(&mut ch, Duration::from_millis(5000), Duration::from_millis(1000)).await.unwrap();
        assert_eq!(message, hex::decode("32121210aabbcc").unwrap());
        assert_eq!(start.elapsed(), Duration::from_millis(1300));
    }

    #[test]
    fn test_find_length_prefixed() {
        let packets = vec![hex::decode("0005aabb").unwrap(), hex::decode("ccddeeff").unwrap()];
        assert_eq!(find_length_prefixed(&packets), Some(hex::decode("aabbccddee").unwrap()));

        let short = vec![hex::decode("0005aabb").unwrap()];
        assert_eq!(find_length_prefixed(&short), None);

        let zero = vec![hex::decode("0000").unwrap(), hex::decode("0001ff").unwrap()];
        assert_eq!(find_length_prefixed(&zero), Some(vec![0xff]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_length_prefixed_skips_sentinels() {
        let transport = MockTransport::new();
        transport
            .notify(&ERROR_SENTINEL)
            .notify(&hex::decode("0003").unwrap())
            .notify(&hex::decode("7a0102").unwrap())
            .deliver();
        let mut ch = characteristic(&transport).await;

        let message = receive_length_prefixed(&mut ch, Duration::from_secs(30), Duration::from_secs(5)).await.unwrap();
        assert_eq!(message, hex::decode("7a0102").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_length_prefixed_incomplete() {
        let transport = MockTransport::new();
        transport.notify(&hex::decode("0010aabb").unwrap()).deliver();
        let mut ch = characteristic(&transport).await;

        let err = receive_length_prefixed(&mut ch, Duration::from_secs(30), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_discards_only_readable_notifications() {
        let transport = MockTransport::new();
        transport.notify(&[0x01]).notify(&[0x02]).deliver();
        transport.notify(&[0x03]);
        let mut ch = characteristic(&transport).await;

        let start = Instant::now();
        assert_eq!(drain_notifications(&mut ch).await.unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(transport.pending_events(), 1);
        assert_eq!(drain_notifications(&mut ch).await.unwrap(), 0);
    }
}
