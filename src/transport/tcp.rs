//! Modbus TCP framer
//!
//! ADU: MBAP header (`txn_id(2) | proto_id(2)=0 | length(2)`) followed by
//! `unit_id(1) | fc(1) | data`. The length field counts from the unit id
//! inclusive, there is no checksum (TCP integrity suffices), and the frame
//! boundary comes from the length field itself.
//!
//! The master generates transaction ids (monotonic, wrapping, never zero)
//! and rejects responses that do not echo the outstanding one; the server
//! records the request's id so its response echoes it. That state travels
//! through [`FrameContext::Tcp`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::{FrameContext, FrameSlot, FrameTransport, ParsedFrame, TransportStats};
use crate::codec::{get_u16_be, put_u16_be};
use crate::constants::{MAX_MBAP_LENGTH, MAX_PDU_DATA_SIZE, MAX_TCP_ADU_LEN, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::format_hex;

/// MBAP header + unit id + function code ahead of the data.
const TCP_OVERHEAD: usize = MBAP_HEADER_LEN + 2;

/// Modbus TCP frame transport over a connected stream.
pub struct TcpFrameTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    /// Inbound bytes pulled off the socket by `data_available`.
    rx_stash: Vec<u8>,
    next_transaction_id: u16,
    max_data_len: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpFrameTransport {
    /// Connect to `address` within `connect_timeout`.
    pub async fn connect(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ModbusError::timeout("TCP connect", connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| ModbusError::connection(format!("failed to connect to {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ModbusError::io(format!("failed to set TCP_NODELAY: {e}")))?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to an address string such as `"10.0.0.5:502"`.
    pub async fn connect_to(address: &str, connect_timeout: Duration) -> ModbusResult<Self> {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid address: {e}")))?;
        Self::connect(address, connect_timeout).await
    }

    /// Wrap an accepted connection (server side).
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            peer,
            rx_stash: Vec::new(),
            next_transaction_id: 0,
            max_data_len: MAX_PDU_DATA_SIZE as u16,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable hex packet logging.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Remote endpoint, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Next transaction id: monotonic, wraps at 2^16, skips zero.
    fn next_transaction_id(&mut self) -> u16 {
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        if self.next_transaction_id == 0 {
            self.next_transaction_id = 1;
        }
        self.next_transaction_id
    }

    /// Pull whatever the socket has ready into the stash without blocking.
    fn poll_socket(&mut self) {
        let mut chunk = [0u8; 512];
        loop {
            let Some(stream) = self.stream.as_ref() else {
                break;
            };
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.stream = None;
                    break;
                }
                Ok(n) => {
                    self.rx_stash.extend_from_slice(&chunk[..n]);
                    self.stats.bytes_received += n as u64;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.stream = None;
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl FrameTransport for TcpFrameTransport {
    fn max_adu_len(&self) -> u16 {
        (self.max_data_len as usize + TCP_OVERHEAD).min(MAX_TCP_ADU_LEN) as u16
    }

    fn max_pdu_data_len(&self) -> u16 {
        self.max_data_len
    }

    fn context(&self) -> FrameContext {
        FrameContext::Tcp { transaction_id: 0 }
    }

    fn data_available(&mut self) -> bool {
        if !self.rx_stash.is_empty() {
            return true;
        }
        self.poll_socket();
        !self.rx_stash.is_empty()
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn receive(
        &mut self,
        buf: &mut [u8],
        _desired_data_len: Option<u16>,
        timeout_window: Duration,
    ) -> ModbusResult<usize> {
        let deadline = Instant::now() + timeout_window;

        // Header first: the MBAP length field tells us the rest.
        while self.rx_stash.len() < MBAP_HEADER_LEN {
            self.fill_stash(deadline, timeout_window).await?;
        }

        let mbap_length = get_u16_be(&self.rx_stash, 4) as usize;
        if mbap_length < 2 || mbap_length > MAX_MBAP_LENGTH {
            // Unrecoverable framing desync; drop the stash.
            self.rx_stash.clear();
            return Err(ModbusError::frame(format!(
                "MBAP length {mbap_length} out of range"
            )));
        }

        let total = MBAP_HEADER_LEN + mbap_length;
        while self.rx_stash.len() < total {
            self.fill_stash(deadline, timeout_window).await?;
        }

        if total > buf.len() {
            self.rx_stash.drain(..total);
            return Err(ModbusError::frame("frame exceeds receive buffer"));
        }
        buf[..total].copy_from_slice(&self.rx_stash[..total]);
        self.rx_stash.drain(..total);

        self.stats.frames_received += 1;
        if self.packet_logging {
            trace!("[TCP] recv {}", format_hex(&buf[..total]));
        }
        Ok(total)
    }

    fn parse(
        &mut self,
        buf: &mut [u8],
        frame_len: usize,
        is_response: bool,
        ctx: &mut FrameContext,
    ) -> ModbusResult<ParsedFrame> {
        if frame_len < TCP_OVERHEAD {
            self.stats.parse_errors += 1;
            return Err(ModbusError::ResponseTooShort { length: frame_len });
        }

        let transaction_id = get_u16_be(buf, 0);
        let protocol_id = get_u16_be(buf, 2);
        let mbap_length = get_u16_be(buf, 4) as usize;

        if protocol_id != 0 {
            self.stats.parse_errors += 1;
            return Err(ModbusError::frame(format!(
                "unexpected MBAP protocol id {protocol_id}"
            )));
        }
        if MBAP_HEADER_LEN + mbap_length != frame_len {
            self.stats.parse_errors += 1;
            return Err(ModbusError::frame(format!(
                "MBAP length {mbap_length} disagrees with frame length {frame_len}"
            )));
        }

        if is_response {
            // Reject responses that do not belong to the outstanding request.
            if let FrameContext::Tcp {
                transaction_id: expected,
            } = *ctx
            {
                if transaction_id != expected {
                    self.stats.parse_errors += 1;
                    return Err(ModbusError::frame(format!(
                        "transaction id mismatch: expected {expected}, got {transaction_id}"
                    )));
                }
            }
        } else {
            // Remember the request id so the response echoes it.
            *ctx = FrameContext::Tcp { transaction_id };
        }

        Ok(ParsedFrame {
            address: buf[6],
            function: buf[7],
            data_pos: TCP_OVERHEAD,
            data_len: frame_len - TCP_OVERHEAD,
        })
    }

    fn build(
        &mut self,
        buf: &mut [u8],
        address: u8,
        function: u8,
        data_len: usize,
        is_response: bool,
        ctx: &mut FrameContext,
    ) -> ModbusResult<FrameSlot> {
        if data_len > self.max_data_len as usize {
            return Err(ModbusError::invalid_data(format!(
                "PDU data length {data_len} exceeds transport maximum {}",
                self.max_data_len
            )));
        }
        let frame_len = TCP_OVERHEAD + data_len;
        if frame_len > buf.len() {
            return Err(ModbusError::invalid_data("frame buffer too small"));
        }

        let transaction_id = if is_response {
            match *ctx {
                FrameContext::Tcp { transaction_id } => transaction_id,
                FrameContext::None => 0,
            }
        } else {
            let id = self.next_transaction_id();
            *ctx = FrameContext::Tcp {
                transaction_id: id,
            };
            id
        };

        put_u16_be(buf, 0, transaction_id);
        put_u16_be(buf, 2, 0); // protocol id
        put_u16_be(buf, 4, (2 + data_len) as u16); // unit id + fc + data
        buf[6] = address;
        buf[7] = function;

        Ok(FrameSlot {
            frame_len,
            data_pos: TCP_OVERHEAD,
        })
    }

    async fn send(&mut self, buf: &mut [u8], frame_len: usize) -> ModbusResult<()> {
        if frame_len < TCP_OVERHEAD || frame_len > self.max_adu_len() as usize {
            return Err(ModbusError::invalid_data(format!(
                "invalid TCP frame length {frame_len}"
            )));
        }
        if self.packet_logging {
            debug!("[TCP] send {}", format_hex(&buf[..frame_len]));
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP stream not connected"))?;
        if let Err(e) = stream.write_all(&buf[..frame_len]).await {
            self.stream = None;
            return Err(ModbusError::io(format!("TCP write error: {e}")));
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame_len as u64;
        Ok(())
    }

    async fn clear_input(&mut self) -> ModbusResult<()> {
        self.rx_stash.clear();
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            if let Some(peer) = self.peer {
                debug!("[TCP] closed connection to {peer}");
            }
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl TcpFrameTransport {
    /// Await more socket data into the stash, bounded by `deadline`.
    async fn fill_stash(
        &mut self,
        deadline: Instant,
        total: Duration,
    ) -> ModbusResult<()> {
        let remaining = super::remaining_window(deadline, "TCP receive", total).map_err(|e| {
            self.stats.timeouts += 1;
            e
        })?;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP stream not connected"))?;

        let mut chunk = [0u8; 512];
        match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                self.stream = None;
                Err(ModbusError::connection("TCP connection closed by peer"))
            }
            Ok(Ok(n)) => {
                self.rx_stash.extend_from_slice(&chunk[..n]);
                self.stats.bytes_received += n as u64;
                Ok(())
            }
            Ok(Err(e)) => {
                self.stream = None;
                Err(ModbusError::io(format!("TCP read error: {e}")))
            }
            Err(_) => {
                self.stats.timeouts += 1;
                Err(ModbusError::timeout(
                    "TCP receive",
                    total.as_millis() as u64,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached() -> TcpFrameTransport {
        TcpFrameTransport {
            stream: None,
            peer: None,
            rx_stash: Vec::new(),
            next_transaction_id: 0,
            max_data_len: MAX_PDU_DATA_SIZE as u16,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    #[test]
    fn test_build_request_frame() {
        let mut t = detached();
        let mut buf = vec![0u8; t.max_adu_len() as usize];
        let mut ctx = t.context();

        let slot = t.build(&mut buf, 0x01, 0x03, 4, false, &mut ctx).unwrap();
        buf[slot.data_pos..slot.data_pos + 4].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);

        // txn=0001, proto=0000, length=0006, unit=01, fc=03
        assert_eq!(
            &buf[..slot.frame_len],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(ctx, FrameContext::Tcp { transaction_id: 1 });
    }

    #[test]
    fn test_server_echoes_transaction_id() {
        let mut t = detached();
        let mut ctx = t.context();

        // Incoming request with txn id 0x1234.
        let mut request = vec![
            0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03,
        ];
        let len = request.len();
        let frame = t.parse(&mut request, len, false, &mut ctx).unwrap();
        assert_eq!(frame.address, 0x11);
        assert_eq!(frame.function, 0x03);
        assert_eq!(ctx, FrameContext::Tcp { transaction_id: 0x1234 });

        // The built response carries the same id.
        let mut response = vec![0u8; 64];
        let slot = t.build(&mut response, 0x11, 0x03, 7, true, &mut ctx).unwrap();
        assert_eq!(get_u16_be(&response, 0), 0x1234);
        assert_eq!(get_u16_be(&response, 4), 9);
        assert_eq!(slot.data_pos, 8);
    }

    #[test]
    fn test_parse_rejects_transaction_mismatch() {
        let mut t = detached();
        let mut ctx = FrameContext::Tcp { transaction_id: 7 };

        let mut response = vec![
            0x00, 0x08, 0x00, 0x00, 0x00, 0x04, 0x01, 0x03, 0x02, 0x00,
        ];
        let len = response.len();
        let err = t.parse(&mut response, len, true, &mut ctx).unwrap_err();
        assert!(matches!(err, ModbusError::Frame { .. }));
    }

    #[test]
    fn test_parse_rejects_protocol_id() {
        let mut t = detached();
        let mut ctx = t.context();
        let mut frame = vec![
            0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
        ];
        let len = frame.len();
        assert!(t.parse(&mut frame, len, false, &mut ctx).is_err());
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut t = detached();
        let mut ctx = t.context();
        let mut frame = vec![
            0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
        ];
        let len = frame.len();
        assert!(t.parse(&mut frame, len, false, &mut ctx).is_err());
    }

    #[test]
    fn test_transaction_id_wraps_and_skips_zero() {
        let mut t = detached();
        t.next_transaction_id = u16::MAX - 1;
        assert_eq!(t.next_transaction_id(), u16::MAX);
        assert_eq!(t.next_transaction_id(), 1);
    }

    #[test]
    fn test_scenario_mbap_echo() {
        // Master request txn=0001 length=0006 unit=01 fc=03 start=0 count=1;
        // the matching response must carry txn=0001 and length=0005.
        let mut master = detached();
        let mut buf = vec![0u8; 64];
        let mut ctx = master.context();
        let slot = master.build(&mut buf, 0x01, 0x03, 4, false, &mut ctx).unwrap();
        buf[slot.data_pos..slot.data_pos + 4].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(get_u16_be(&buf, 0), 0x0001);

        let mut response = vec![
            0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34,
        ];
        let len = response.len();
        let frame = master.parse(&mut response, len, true, &mut ctx).unwrap();
        assert_eq!(frame.data(&response), &[0x02, 0x12, 0x34]);
    }
}
