//! Framing transport layer
//!
//! A [`FrameTransport`] encapsulates one physical channel and everything
//! variant-specific about it: ADU boundaries, checksum discipline,
//! inter-frame timing and half-duplex direction control. Three framings are
//! provided:
//!
//! | Framing | ADU | Checksum | End of frame |
//! |---------|-----|----------|--------------|
//! | RTU     | `addr fc data crc_lo crc_hi` | CRC-16 | 3.5-char idle |
//! | ASCII   | `':' hex(addr) hex(fc) hex(data) hex(lrc) CR LF` | LRC-8 | CR LF |
//! | TCP     | `txn(2) proto(2) len(2) unit(1) fc(1) data` | none | MBAP length |
//!
//! The server and the master drive transports through the same call
//! sequence: `receive` pulls one complete ADU into the caller's buffer,
//! `parse` validates framing and checksums and locates the PDU inside the
//! buffer, `build` lays down the framing prefix for an outgoing PDU, and
//! `send` finalizes (checksum append / hex encoding), enforces the minimum
//! inter-frame gap and writes the frame out.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ModbusError, ModbusResult};

#[cfg(feature = "serial")]
mod ascii;
#[cfg(feature = "serial")]
mod rtu;
mod tcp;

#[cfg(feature = "serial")]
pub use ascii::AsciiFrameTransport;
#[cfg(feature = "serial")]
pub use rtu::RtuFrameTransport;
#[cfg(feature = "serial")]
pub use serial::SerialPortSettings;
pub use tcp::TcpFrameTransport;

/// Variant-specific state threaded through `build`/`parse` pairs.
///
/// Only TCP uses it: the master generates a transaction id in `build` and
/// the parser rejects responses that do not echo it; the server records the
/// request's transaction id so the response echoes it back. RTU and ASCII
/// ignore the context entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameContext {
    /// No per-frame state (RTU, ASCII).
    #[default]
    None,
    /// MBAP transaction id of the outstanding exchange.
    Tcp { transaction_id: u16 },
}

/// Location of a validated PDU inside the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame {
    /// Device address (MBAP unit id for TCP).
    pub address: u8,
    /// Function code, exception flag included.
    pub function: u8,
    /// Offset of the PDU data within the buffer.
    pub data_pos: usize,
    /// Length of the PDU data.
    pub data_len: usize,
}

impl ParsedFrame {
    /// The PDU data slice within `buf`.
    #[inline]
    pub fn data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.data_pos..self.data_pos + self.data_len]
    }

    /// True when the function code carries the exception flag.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }
}

/// Layout of a frame under construction, as returned by
/// [`FrameTransport::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Length to pass to [`FrameTransport::send`] once the data is filled.
    pub frame_len: usize,
    /// Offset at which the caller writes the PDU data.
    pub data_pos: usize,
}

/// Transport layer statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub parse_errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Half-duplex line direction control for RS-485 transceivers.
///
/// The engine asserts transmit immediately before writing a frame and
/// releases it after the transmit path has drained. GPIO access itself is an
/// external collaborator: implement this trait over whatever pin interface
/// the platform provides. Full-duplex links need no implementation.
pub trait DirectionControl: Send {
    /// Drive the DE/RE pin. `transmit == true` claims the line.
    fn set_transmit(&mut self, transmit: bool) -> ModbusResult<()>;
}

/// How a serial framer drives the line direction.
pub enum LineDirection {
    /// Full-duplex or auto-direction hardware: no switching.
    FullDuplex,
    /// Toggle the port's RTS output. `assert_on_transmit` selects polarity.
    Rts { assert_on_transmit: bool },
    /// User-supplied pin driver (GPIO, ioctl, expander).
    External(Box<dyn DirectionControl>),
}

impl std::fmt::Debug for LineDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineDirection::FullDuplex => write!(f, "FullDuplex"),
            LineDirection::Rts { assert_on_transmit } => f
                .debug_struct("Rts")
                .field("assert_on_transmit", assert_on_transmit)
                .finish(),
            LineDirection::External(_) => write!(f, "External(..)"),
        }
    }
}

impl Default for LineDirection {
    fn default() -> Self {
        LineDirection::FullDuplex
    }
}

/// Framed transport abstraction implemented by the RTU, ASCII and TCP
/// framers.
///
/// Implementations may buffer inbound bytes internally but must not silently
/// drop valid frames.
#[async_trait]
pub trait FrameTransport: Send {
    /// Upper bound on a single ADU for this framing.
    fn max_adu_len(&self) -> u16;

    /// Upper bound on the PDU data a single frame of this framing carries.
    fn max_pdu_data_len(&self) -> u16;

    /// Fresh per-exchange context for this framing.
    fn context(&self) -> FrameContext {
        FrameContext::None
    }

    /// Nonblocking poll for inbound bytes.
    fn data_available(&mut self) -> bool;

    /// Whether the underlying channel is usable.
    fn is_connected(&self) -> bool;

    /// Switch a half-duplex line towards transmit. No-op on full-duplex
    /// media.
    async fn prepare_write(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    /// Switch a half-duplex line back to receive, after draining the
    /// transmit path. No-op on full-duplex media.
    async fn prepare_read(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    /// Receive one complete ADU into `buf`, blocking up to `timeout`.
    ///
    /// `desired_data_len` is the expected PDU data length when the caller
    /// knows it (master side, normal responses); the framer may use it as a
    /// hard length target and may shorten the target when the inbound
    /// function code carries the exception flag. With `None` the framer
    /// detects end-of-frame natively (RTU idle gap, ASCII CR LF, MBAP
    /// length).
    async fn receive(
        &mut self,
        buf: &mut [u8],
        desired_data_len: Option<u16>,
        timeout: Duration,
    ) -> ModbusResult<usize>;

    /// Validate framing and checksum of `buf[..frame_len]` and locate the
    /// PDU. ASCII decodes the hex payload in place. For TCP responses the
    /// context carries the expected transaction id; for TCP requests the
    /// parser stores the received one.
    fn parse(
        &mut self,
        buf: &mut [u8],
        frame_len: usize,
        is_response: bool,
        ctx: &mut FrameContext,
    ) -> ModbusResult<ParsedFrame>;

    /// Write the framing prefix for an outgoing PDU of `data_len` data bytes
    /// into `buf`, reserving room for the caller to fill the data. Checksums
    /// are appended by [`send`](Self::send), not here.
    fn build(
        &mut self,
        buf: &mut [u8],
        address: u8,
        function: u8,
        data_len: usize,
        is_response: bool,
        ctx: &mut FrameContext,
    ) -> ModbusResult<FrameSlot>;

    /// Finalize and transmit `buf[..frame_len]`: append CRC/LRC or hex
    /// encoding as the framing requires, enforce the minimum inter-frame
    /// gap, then write and flush.
    async fn send(&mut self, buf: &mut [u8], frame_len: usize) -> ModbusResult<()>;

    /// Purge buffered inbound bytes so the line resynchronizes at the next
    /// frame boundary. Called after parse failures.
    async fn clear_input(&mut self) -> ModbusResult<()>;

    /// Release the underlying OS resources.
    async fn close(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    /// Communication statistics.
    fn get_stats(&self) -> TransportStats;
}

/// Map an elapsed-deadline subtraction into the remaining window, erroring
/// with a timeout once the window is exhausted.
pub(crate) fn remaining_window(
    deadline: tokio::time::Instant,
    operation: &str,
    total: Duration,
) -> ModbusResult<Duration> {
    let now = tokio::time::Instant::now();
    if now >= deadline {
        return Err(ModbusError::timeout(operation, total.as_millis() as u64));
    }
    Ok(deadline - now)
}

#[cfg(feature = "serial")]
pub(crate) mod serial {
    //! Shared serial-port plumbing for the RTU and ASCII framers.

    use std::time::Duration;

    use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

    use crate::error::{ModbusError, ModbusResult};

    /// Serial line parameters shared by the RTU and ASCII framers.
    #[derive(Debug, Clone)]
    pub struct SerialPortSettings {
        pub baud_rate: u32,
        pub data_bits: DataBits,
        pub stop_bits: StopBits,
        pub parity: Parity,
    }

    impl SerialPortSettings {
        /// Common RTU default: 8 data bits, no parity, one stop bit.
        pub fn rtu_default(baud_rate: u32) -> Self {
            Self {
                baud_rate,
                data_bits: DataBits::Eight,
                stop_bits: StopBits::One,
                parity: Parity::None,
            }
        }

        /// Common ASCII default: 7 data bits, even parity, one stop bit.
        pub fn ascii_default(baud_rate: u32) -> Self {
            Self {
                baud_rate,
                data_bits: DataBits::Seven,
                stop_bits: StopBits::One,
                parity: Parity::Even,
            }
        }

        /// Bits on the wire per character, start bit included.
        pub fn bits_per_char(&self) -> u32 {
            let data = match self.data_bits {
                DataBits::Five => 5,
                DataBits::Six => 6,
                DataBits::Seven => 7,
                DataBits::Eight => 8,
            };
            let stop = match self.stop_bits {
                StopBits::One => 1,
                StopBits::Two => 2,
            };
            let parity = match self.parity {
                Parity::None => 0,
                Parity::Even | Parity::Odd => 1,
            };
            1 + data + parity + stop
        }

        /// Duration of one character at the configured rate.
        pub fn char_time(&self) -> Duration {
            let micros = (self.bits_per_char() as u64 * 1_000_000) / self.baud_rate as u64;
            Duration::from_micros(micros.max(1))
        }
    }

    /// Open the serial port described by `path` and `settings`.
    pub fn open_port(path: &str, settings: &SerialPortSettings) -> ModbusResult<SerialStream> {
        tokio_serial::new(path, settings.baud_rate)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .parity(settings.parity)
            .timeout(Duration::from_millis(10))
            .open_native_async()
            .map_err(|e| {
                ModbusError::connection(format!("failed to open serial port {path}: {e}"))
            })
    }
}
