//! Modbus ASCII framer
//!
//! Frame grammar: `':' hex(addr) hex(fc) hex(data...) hex(lrc) CR LF`. Every
//! raw byte travels as two upper-case hex characters (lower case accepted on
//! receive); the LRC is computed over the raw bytes, not their hex encoding.
//! Unlike RTU the frame boundaries are explicit sentinels, so line timing is
//! only used as an inter-character idle limit (one second, per the serial
//! line specification).
//!
//! `parse` decodes the hex payload in place into the front of the receive
//! buffer, so the buffer must be writable and large enough for the full wire
//! frame.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, trace};

use super::serial::{open_port, SerialPortSettings};
use super::{FrameContext, FrameSlot, FrameTransport, ParsedFrame, TransportStats};
use crate::codec::{byte_to_hex_pair, hex_pair_to_byte, lrc8};
use crate::constants::{EXCEPTION_FLAG, MAX_PDU_DATA_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::format_hex;

const FRAME_START: u8 = b':';
const FRAME_CR: u8 = 0x0D;
const FRAME_LF: u8 = 0x0A;

/// Raw bytes around the PDU data: address + function ahead, LRC behind.
const ASCII_RAW_OVERHEAD: usize = 3;

/// Smallest possible wire frame: `':'` + 2 raw bytes + LRC as hex + CR LF.
const MIN_WIRE_FRAME: usize = 1 + 2 * ASCII_RAW_OVERHEAD + 2;

/// Inter-character idle limit from the serial line specification.
const INTER_CHAR_TIMEOUT: Duration = Duration::from_secs(1);

/// Modbus ASCII frame transport over a serial port.
pub struct AsciiFrameTransport {
    port: Option<SerialStream>,
    port_name: String,
    settings: SerialPortSettings,
    max_data_len: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl AsciiFrameTransport {
    /// Open `path` with the common ASCII format (7E1) at `baud_rate`.
    pub fn new(path: &str, baud_rate: u32) -> ModbusResult<Self> {
        Self::new_with_settings(path, SerialPortSettings::ascii_default(baud_rate))
    }

    /// Open `path` with explicit line settings.
    pub fn new_with_settings(path: &str, settings: SerialPortSettings) -> ModbusResult<Self> {
        let port = open_port(path, &settings)?;
        Ok(Self::from_parts(Some(port), path.to_string(), settings))
    }

    fn from_parts(port: Option<SerialStream>, port_name: String, settings: SerialPortSettings) -> Self {
        Self {
            port,
            port_name,
            settings,
            max_data_len: MAX_PDU_DATA_SIZE as u16,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Restrict the PDU data length below the protocol maximum of 252.
    pub fn with_max_data_len(mut self, max_data_len: u16) -> ModbusResult<Self> {
        if max_data_len == 0 || max_data_len as usize > MAX_PDU_DATA_SIZE {
            return Err(ModbusError::configuration(format!(
                "max_data_len {max_data_len} outside 1..={MAX_PDU_DATA_SIZE}"
            )));
        }
        self.max_data_len = max_data_len;
        Ok(self)
    }

    /// Enable or disable hex packet logging.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Serial line settings this transport was opened with.
    pub fn settings(&self) -> &SerialPortSettings {
        &self.settings
    }

    /// Hex-encode the raw frame `raw` (address, function, data) into a wire
    /// frame, appending the LRC and the frame sentinels.
    fn encode_frame(raw: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(1 + 2 * (raw.len() + 1) + 2);
        wire.push(FRAME_START);
        for &byte in raw {
            wire.extend_from_slice(&byte_to_hex_pair(byte));
        }
        wire.extend_from_slice(&byte_to_hex_pair(lrc8(raw)));
        wire.push(FRAME_CR);
        wire.push(FRAME_LF);
        wire
    }

    /// Wire frame length for a known PDU data length.
    fn expected_frame_len(desired_data_len: u16) -> usize {
        1 + 2 * (desired_data_len as usize + ASCII_RAW_OVERHEAD) + 2
    }
}

#[async_trait::async_trait]
impl FrameTransport for AsciiFrameTransport {
    fn max_adu_len(&self) -> u16 {
        Self::expected_frame_len(self.max_data_len) as u16
    }

    fn max_pdu_data_len(&self) -> u16 {
        self.max_data_len
    }

    fn data_available(&mut self) -> bool {
        match self.port.as_ref() {
            Some(port) => port.bytes_to_read().map(|n| n > 0).unwrap_or(false),
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn receive(
        &mut self,
        buf: &mut [u8],
        desired_data_len: Option<u16>,
        timeout_window: Duration,
    ) -> ModbusResult<usize> {
        let max_len = (self.max_adu_len() as usize).min(buf.len());
        let deadline = Instant::now() + timeout_window;

        let mut len = 0usize;
        let mut target = desired_data_len.map(Self::expected_frame_len);
        let mut bytes_in = 0u64;
        let mut closed = false;

        let result: ModbusResult<usize> = {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| ModbusError::connection("serial port not open"))?;

            loop {
                // Explicit frame end beats any length target.
                if len >= 2 && buf[len - 2] == FRAME_CR && buf[len - 1] == FRAME_LF {
                    break Ok(len);
                }
                if let Some(t) = target {
                    if len >= t.min(max_len) {
                        break Ok(len);
                    }
                }
                if len >= max_len {
                    break Ok(len);
                }

                let remaining =
                    match super::remaining_window(deadline, "ASCII receive", timeout_window) {
                        Ok(r) => r,
                        Err(e) => {
                            if len > 0 {
                                break Ok(len);
                            }
                            break Err(e);
                        }
                    };
                let window = if len == 0 {
                    remaining
                } else {
                    INTER_CHAR_TIMEOUT.min(remaining)
                };

                match timeout(window, port.read(&mut buf[len..max_len])).await {
                    Ok(Ok(0)) => {
                        closed = true;
                        break Err(ModbusError::connection("serial port closed"));
                    }
                    Ok(Ok(n)) => {
                        len += n;
                        bytes_in += n as u64;
                        // Resynchronize: everything before the start sentinel
                        // is line noise.
                        if let Some(start) = buf[..len].iter().position(|&b| b == FRAME_START) {
                            if start > 0 {
                                buf.copy_within(start..len, 0);
                                len -= start;
                            }
                        } else {
                            len = 0;
                        }
                        // The exception flag shortens the expected frame: the
                        // function code sits at wire positions 3..=4.
                        if target.is_some() && len >= 5 {
                            if let Ok(fc) = hex_pair_to_byte(buf[3], buf[4]) {
                                if fc & EXCEPTION_FLAG != 0 {
                                    target = Some(Self::expected_frame_len(1));
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        break Err(ModbusError::io(format!("serial read error: {e}")));
                    }
                    Err(_) => {
                        if len > 0 {
                            break Ok(len);
                        }
                        if Instant::now() >= deadline {
                            break Err(ModbusError::timeout(
                                "ASCII receive",
                                timeout_window.as_millis() as u64,
                            ));
                        }
                    }
                }
            }
        };

        self.stats.bytes_received += bytes_in;
        if closed {
            self.port = None;
        }
        match result {
            Ok(len) => {
                self.stats.frames_received += 1;
                if self.packet_logging {
                    trace!("[ASCII] recv {}", format_hex(&buf[..len]));
                }
                Ok(len)
            }
            Err(e) => {
                if matches!(e, ModbusError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                Err(e)
            }
        }
    }

    fn parse(
        &mut self,
        buf: &mut [u8],
        frame_len: usize,
        _is_response: bool,
        _ctx: &mut FrameContext,
    ) -> ModbusResult<ParsedFrame> {
        if frame_len < MIN_WIRE_FRAME {
            self.stats.parse_errors += 1;
            return Err(ModbusError::ResponseTooShort { length: frame_len });
        }
        if buf[0] != FRAME_START {
            self.stats.parse_errors += 1;
            return Err(ModbusError::frame("missing ':' start sentinel"));
        }
        if buf[frame_len - 2] != FRAME_CR || buf[frame_len - 1] != FRAME_LF {
            self.stats.parse_errors += 1;
            return Err(ModbusError::frame("missing CR LF end sentinel"));
        }

        let hex_len = frame_len - 3;
        if hex_len % 2 != 0 {
            self.stats.parse_errors += 1;
            return Err(ModbusError::frame("odd hex payload length"));
        }

        // Decode in place: the write index always trails the read index.
        let raw_len = hex_len / 2;
        for i in 0..raw_len {
            match hex_pair_to_byte(buf[1 + 2 * i], buf[2 + 2 * i]) {
                Ok(byte) => buf[i] = byte,
                Err(_) => {
                    self.stats.parse_errors += 1;
                    return Err(ModbusError::frame("invalid hex character in frame"));
                }
            }
        }

        let expected = lrc8(&buf[..raw_len - 1]);
        let actual = buf[raw_len - 1];
        if expected != actual {
            self.stats.parse_errors += 1;
            return Err(ModbusError::LrcMismatch { expected, actual });
        }

        Ok(ParsedFrame {
            address: buf[0],
            function: buf[1],
            data_pos: 2,
            data_len: raw_len - ASCII_RAW_OVERHEAD,
        })
    }

    fn build(
        &mut self,
        buf: &mut [u8],
        address: u8,
        function: u8,
        data_len: usize,
        _is_response: bool,
        _ctx: &mut FrameContext,
    ) -> ModbusResult<FrameSlot> {
        if data_len > self.max_data_len as usize {
            return Err(ModbusError::invalid_data(format!(
                "PDU data length {data_len} exceeds transport maximum {}",
                self.max_data_len
            )));
        }
        // `build` lays down the raw frame; `send` hex-encodes it.
        let frame_len = 2 + data_len;
        if frame_len > buf.len() {
            return Err(ModbusError::invalid_data("frame buffer too small"));
        }
        buf[0] = address;
        buf[1] = function;
        Ok(FrameSlot {
            frame_len,
            data_pos: 2,
        })
    }

    async fn send(&mut self, buf: &mut [u8], frame_len: usize) -> ModbusResult<()> {
        if frame_len < 2 || frame_len > 2 + self.max_data_len as usize {
            return Err(ModbusError::invalid_data(format!(
                "invalid ASCII raw frame length {frame_len}"
            )));
        }
        let wire = Self::encode_frame(&buf[..frame_len]);

        if self.packet_logging {
            debug!("[ASCII] send {}", format_hex(&wire));
        }

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("serial port not open"))?;
        port.write_all(&wire)
            .await
            .map_err(|e| ModbusError::io(format!("serial write error: {e}")))?;
        port.flush()
            .await
            .map_err(|e| ModbusError::io(format!("serial flush error: {e}")))?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += wire.len() as u64;
        Ok(())
    }

    async fn clear_input(&mut self) -> ModbusResult<()> {
        if let Some(port) = self.port.as_ref() {
            port.clear(ClearBuffer::Input)
                .map_err(|e| ModbusError::io(format!("failed to clear input: {e}")))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.port.take().is_some() {
            debug!("[ASCII] closed {}", self.port_name);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
