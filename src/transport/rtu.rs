//! Modbus RTU framer
//!
//! Binary ADU `addr | fc | data | crc_lo | crc_hi` over a serial line. The
//! CRC-16 covers everything before it and travels low byte first, while all
//! payload integers stay big-endian. Frames are delimited by line silence:
//! 3.5 character times between frames, 1.5 between characters of one frame.
//! Above 19 200 baud the specification fixes the gaps at 1.75 ms / 750 µs.
//!
//! On RS-485 links the framer claims the line via [`LineDirection`] right
//! before writing and releases it once the transmit path has drained.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, trace};

use super::serial::{open_port, SerialPortSettings};
use super::{FrameContext, FrameSlot, FrameTransport, LineDirection, ParsedFrame, TransportStats};
use crate::codec::crc16;
use crate::constants::{
    EXCEPTION_FLAG, FIXED_GAP_BAUD_THRESHOLD, FIXED_INTER_FRAME_GAP_US, MAX_PDU_DATA_SIZE,
    MAX_RTU_ADU_LEN,
};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::format_hex;

/// Address + function code ahead of the data, CRC behind it.
const RTU_OVERHEAD: usize = 4;

/// ADU length of an RTU exception response: addr + fc + code + CRC.
const RTU_EXCEPTION_FRAME_LEN: usize = 5;

/// Modbus counts 11 bits per character for line timing regardless of the
/// configured frame format.
const TIMING_BITS_PER_CHAR: u64 = 11;

/// Modbus RTU frame transport over a serial port.
pub struct RtuFrameTransport {
    port: Option<SerialStream>,
    port_name: String,
    settings: SerialPortSettings,
    /// Largest PDU data length this transport accepts (default 252).
    max_data_len: u16,
    /// Minimum silence between frames (3.5 characters).
    inter_frame_gap: Duration,
    /// Maximum silence inside one frame (1.5 characters).
    inter_char_timeout: Duration,
    /// Earliest instant the next frame may start.
    next_send_at: Option<Instant>,
    direction: LineDirection,
    stats: TransportStats,
    packet_logging: bool,
}

impl RtuFrameTransport {
    /// Open `path` with the common 8N1 format at `baud_rate`.
    pub fn new(path: &str, baud_rate: u32) -> ModbusResult<Self> {
        Self::new_with_settings(path, SerialPortSettings::rtu_default(baud_rate))
    }

    /// Open `path` with explicit line settings.
    pub fn new_with_settings(path: &str, settings: SerialPortSettings) -> ModbusResult<Self> {
        let port = open_port(path, &settings)?;
        Ok(Self::from_parts(Some(port), path.to_string(), settings))
    }

    fn from_parts(port: Option<SerialStream>, port_name: String, settings: SerialPortSettings) -> Self {
        let (inter_frame_gap, inter_char_timeout) = line_timing(settings.baud_rate);
        Self {
            port,
            port_name,
            settings,
            max_data_len: MAX_PDU_DATA_SIZE as u16,
            inter_frame_gap,
            inter_char_timeout,
            next_send_at: None,
            direction: LineDirection::FullDuplex,
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

    /// Configure half-duplex direction control.
    pub fn with_direction(mut self, direction: LineDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Enable or disable hex packet logging.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Serial line settings this transport was opened with.
    pub fn settings(&self) -> &SerialPortSettings {
        &self.settings
    }

    /// The enforced minimum inter-frame gap.
    pub fn inter_frame_gap(&self) -> Duration {
        self.inter_frame_gap
    }

    fn port_mut(&mut self) -> ModbusResult<&mut SerialStream> {
        self.port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("serial port not open"))
    }

    fn set_direction(&mut self, transmit: bool) -> ModbusResult<()> {
        match &mut self.direction {
            LineDirection::FullDuplex => Ok(()),
            LineDirection::Rts { assert_on_transmit } => {
                let level = if transmit {
                    *assert_on_transmit
                } else {
                    !*assert_on_transmit
                };
                let port = self
                    .port
                    .as_mut()
                    .ok_or_else(|| ModbusError::connection("serial port not open"))?;
                port.write_request_to_send(level)
                    .map_err(|e| ModbusError::io(format!("RTS switch failed: {e}")))
            }
            LineDirection::External(ctl) => ctl.set_transmit(transmit),
        }
    }

    /// Append the CRC to a built frame.
    fn seal(buf: &mut [u8], frame_len: usize) {
        let crc = crc16(&buf[..frame_len - 2]);
        buf[frame_len - 2..frame_len].copy_from_slice(&crc.to_le_bytes());
    }
}

/// 3.5 / 1.5 character times for `baud_rate`, with the fixed values the
/// specification mandates above 19 200 baud.
fn line_timing(baud_rate: u32) -> (Duration, Duration) {
    if baud_rate > FIXED_GAP_BAUD_THRESHOLD {
        (
            Duration::from_micros(FIXED_INTER_FRAME_GAP_US),
            Duration::from_micros(750),
        )
    } else {
        let char_us = TIMING_BITS_PER_CHAR * 1_000_000 / baud_rate as u64;
        (
            Duration::from_micros(char_us * 35 / 10),
            Duration::from_micros(char_us * 15 / 10),
        )
    }
}

/// Expected total ADU length for a known response data length.
fn expected_frame_len(desired_data_len: u16) -> usize {
    desired_data_len as usize + RTU_OVERHEAD
}

#[async_trait::async_trait]
impl FrameTransport for RtuFrameTransport {
    fn max_adu_len(&self) -> u16 {
        (self.max_data_len as usize + RTU_OVERHEAD).min(MAX_RTU_ADU_LEN) as u16
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

    async fn prepare_write(&mut self) -> ModbusResult<()> {
        self.set_direction(true)
    }

    async fn prepare_read(&mut self) -> ModbusResult<()> {
        // Drain the transmit shift register before giving up the line.
        if let Ok(port) = self.port_mut() {
            let _ = port.flush().await;
        }
        self.set_direction(false)
    }

    async fn receive(
        &mut self,
        buf: &mut [u8],
        desired_data_len: Option<u16>,
        timeout_window: Duration,
    ) -> ModbusResult<usize> {
        let max_len = (self.max_adu_len() as usize).min(buf.len());
        let idle = self.inter_char_timeout.max(self.inter_frame_gap);
        let deadline = Instant::now() + timeout_window;

        let mut len = 0usize;
        let mut target = desired_data_len.map(expected_frame_len);
        let mut bytes_in = 0u64;
        let mut closed = false;

        let result: ModbusResult<usize> = {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| ModbusError::connection("serial port not open"))?;

            loop {
                if let Some(t) = target {
                    if len >= t.min(max_len) {
                        break Ok(len);
                    }
                }
                if len >= max_len {
                    break Ok(len);
                }

                let remaining = match super::remaining_window(deadline, "RTU receive", timeout_window)
                {
                    Ok(r) => r,
                    Err(e) => {
                        if len > 0 {
                            break Ok(len);
                        }
                        break Err(e);
                    }
                };
                // A started frame ends at the first 1.5-char silence.
                let window = if len == 0 { remaining } else { idle.min(remaining) };

                match timeout(window, port.read(&mut buf[len..max_len])).await {
                    Ok(Ok(0)) => {
                        closed = true;
                        break Err(ModbusError::connection("serial port closed"));
                    }
                    Ok(Ok(n)) => {
                        len += n;
                        bytes_in += n as u64;
                        // Exception responses are shorter than the expected
                        // normal response; retarget as soon as the flag shows.
                        if target.is_some() && len >= 2 && buf[1] & EXCEPTION_FLAG != 0 {
                            target = Some(RTU_EXCEPTION_FRAME_LEN);
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
                                "RTU receive",
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
                    trace!("[RTU] recv {}", format_hex(&buf[..len]));
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
        if frame_len < RTU_OVERHEAD {
            self.stats.parse_errors += 1;
            return Err(ModbusError::ResponseTooShort { length: frame_len });
        }

        let crc_pos = frame_len - 2;
        let expected = crc16(&buf[..crc_pos]);
        let actual = u16::from_le_bytes([buf[crc_pos], buf[crc_pos + 1]]);
        if expected != actual {
            self.stats.parse_errors += 1;
            return Err(ModbusError::CrcMismatch { expected, actual });
        }

        Ok(ParsedFrame {
            address: buf[0],
            function: buf[1],
            data_pos: 2,
            data_len: frame_len - RTU_OVERHEAD,
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
        let frame_len = data_len + RTU_OVERHEAD;
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
        if frame_len < RTU_OVERHEAD || frame_len > self.max_adu_len() as usize {
            return Err(ModbusError::invalid_data(format!(
                "invalid RTU frame length {frame_len}"
            )));
        }
        Self::seal(buf, frame_len);

        // Honor the 3.5-character silence since the previous frame.
        if let Some(at) = self.next_send_at {
            sleep_until(at).await;
        }

        if self.packet_logging {
            debug!("[RTU] send {}", format_hex(&buf[..frame_len]));
        }

        let port = self.port_mut()?;
        port.write_all(&buf[..frame_len])
            .await
            .map_err(|e| ModbusError::io(format!("serial write error: {e}")))?;
        port.flush()
            .await
            .map_err(|e| ModbusError::io(format!("serial flush error: {e}")))?;

        self.next_send_at = Some(Instant::now() + self.inter_frame_gap);
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame_len as u64;
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
            debug!("[RTU] closed {}", self.port_name);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport with no port behind it, for exercising the pure framing
    /// paths.
    fn detached(baud_rate: u32) -> RtuFrameTransport {
        RtuFrameTransport::from_parts(
            None,
            "detached".to_string(),
            SerialPortSettings::rtu_default(baud_rate),
        )
    }

    #[test]
    fn test_build_seal_parse_round_trip() {
        let mut t = detached(9600);
        let mut buf = vec![0u8; t.max_adu_len() as usize];
        let mut ctx = FrameContext::None;

        let slot = t.build(&mut buf, 0x01, 0x03, 4, false, &mut ctx).unwrap();
        assert_eq!(slot.data_pos, 2);
        assert_eq!(slot.frame_len, 8);
        buf[slot.data_pos..slot.data_pos + 4].copy_from_slice(&[0x00, 0x00, 0x00, 0x02]);
        RtuFrameTransport::seal(&mut buf, slot.frame_len);

        assert_eq!(
            &buf[..slot.frame_len],
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );

        let frame = t.parse(&mut buf, slot.frame_len, false, &mut ctx).unwrap();
        assert_eq!(frame.address, 0x01);
        assert_eq!(frame.function, 0x03);
        assert_eq!(frame.data(&buf), &[0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_parse_response_frame() {
        let mut t = detached(9600);
        let mut buf = vec![0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xB5, 0xA7];
        let mut ctx = FrameContext::None;
        let len = buf.len();

        let frame = t.parse(&mut buf, len, true, &mut ctx).unwrap();
        assert_eq!(frame.address, 0x01);
        assert_eq!(frame.function, 0x03);
        assert_eq!(frame.data(&buf), &[0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_parse_rejects_any_flipped_bit() {
        let good = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        let mut t = detached(9600);
        let mut ctx = FrameContext::None;

        // Flip every bit outside the CRC field; parse must fail each time.
        for byte in 0..good.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = good;
                corrupted[byte] ^= 1 << bit;
                let mut buf = corrupted.to_vec();
                let len = buf.len();
                let err = t.parse(&mut buf, len, false, &mut ctx).unwrap_err();
                assert!(
                    matches!(err, ModbusError::CrcMismatch { .. }),
                    "byte {byte} bit {bit}: {err:?}"
                );
            }
        }
    }

    #[test]
    fn test_parse_rejects_short_frames() {
        let mut t = detached(9600);
        let mut ctx = FrameContext::None;
        let mut buf = vec![0x01, 0x03, 0x00];
        let err = t.parse(&mut buf, 3, false, &mut ctx).unwrap_err();
        assert!(matches!(err, ModbusError::ResponseTooShort { .. }));
    }

    #[test]
    fn test_inter_frame_gap_at_9600() {
        // 3.5 characters of 11 bits at 9600 baud is just over 4 ms.
        let t = detached(9600);
        assert!(t.inter_frame_gap() >= Duration::from_millis(4));
        assert!(t.inter_frame_gap() < Duration::from_millis(5));
    }

    #[test]
    fn test_inter_frame_gap_fixed_above_19200() {
        let t = detached(115_200);
        assert_eq!(t.inter_frame_gap(), Duration::from_micros(1_750));
    }

    #[test]
    fn test_expected_frame_len() {
        // FC03 response for 2 registers: byte count + 4 data bytes.
        assert_eq!(expected_frame_len(5), 9);
        // Exception responses shrink to 5 bytes total.
        assert_eq!(RTU_EXCEPTION_FRAME_LEN, 5);
    }

    #[test]
    fn test_build_enforces_max_data_len() {
        let mut t = detached(9600);
        let mut big = vec![0u8; 600];
        let mut ctx = FrameContext::None;
        assert!(t.build(&mut big, 1, 0x10, 300, false, &mut ctx).is_err());
    }

    #[test]
    fn test_exception_frame_round_trip() {
        let mut t = detached(9600);
        let mut buf = vec![0u8; 64];
        let mut ctx = FrameContext::None;

        let slot = t.build(&mut buf, 0x07, 0x42 | 0x80, 1, true, &mut ctx).unwrap();
        buf[slot.data_pos] = 0x01;
        RtuFrameTransport::seal(&mut buf, slot.frame_len);
        assert_eq!(slot.frame_len, RTU_EXCEPTION_FRAME_LEN);

        let frame = t.parse(&mut buf, slot.frame_len, true, &mut ctx).unwrap();
        assert!(frame.is_exception());
        assert_eq!(frame.function, 0xC2);
        assert_eq!(frame.data(&buf), &[0x01]);
    }
}
