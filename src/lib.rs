//! # Ferrite Modbus - Modbus Protocol Engine
//!
//! A Modbus Application Protocol v1.1b engine in pure Rust, implementing
//! both the **server (device)** and **master (client)** roles over three
//! framings: **RTU** (binary + CRC-16), **ASCII** (hex + LRC) and **TCP**
//! (MBAP header).
//!
//! ## Features
//!
//! - **Pluggable framing**: one [`FrameTransport`] contract covering ADU
//!   boundaries, checksum discipline, inter-frame timing (3.5-character
//!   silence for RTU, `':'`/CR LF sentinels for ASCII, MBAP length for TCP)
//!   and RS-485 direction switching
//! - **Multi-transport server**: a single poll-loop worker demultiplexes
//!   requests across every registered transport, routes by device address
//!   (broadcast, unicast, TCP "accept any" 248) and answers with responses
//!   or exception frames without ever desynchronizing the line
//! - **Correlating master**: synchronous exchanges with bounded timeout,
//!   stray-frame discard and exception decoding, tolerant of shared-bus
//!   traffic
//! - **Device identification**: function 0x2B/0x0E with more-follows paging
//!   in both roles
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x07 | Read Exception Status | ✅ | — |
//! | 0x08 | Diagnostics | ✅ | — |
//! | 0x0B | Get Comm Event Counter | ✅ | — |
//! | 0x0C | Get Comm Event Log | ✅ | — |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//! | 0x2B | Read Device Identification | ✅ | ✅ |
//!
//! Unknown function codes reach [`DeviceHandler::custom_request`] on the
//! server side.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrite_modbus::{ModbusMaster, ModbusResult, TcpFrameTransport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let transport =
//!         TcpFrameTransport::connect_to("127.0.0.1:502", Duration::from_secs(5)).await?;
//!     let mut master = ModbusMaster::new(transport);
//!
//!     let values = master.read_03(1, 0, 10, Duration::from_secs(2)).await?;
//!     println!("Read registers: {values:?}");
//!
//!     master.write_06(1, 100, 0x1234, Duration::from_secs(2)).await?;
//!
//!     master.close().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Wire-level byte utilities (CRC-16, LRC-8, hex nibbles, bit packing)
pub mod codec;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// Framing transport layer for RTU, ASCII and TCP
pub mod transport;

/// Modbus server dispatcher
pub mod server;

/// Modbus master implementation
pub mod client;

/// Device identification sub-protocol (0x2B/0x0E)
pub mod identity;

/// Logging system for the library
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use ferrite_modbus::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ExceptionCode, ModbusError, ModbusResult};

// === Framing layer ===
pub use transport::{
    DirectionControl, FrameContext, FrameSlot, FrameTransport, LineDirection, ParsedFrame,
    TcpFrameTransport, TransportStats,
};

#[cfg(feature = "serial")]
pub use transport::{AsciiFrameTransport, RtuFrameTransport, SerialPortSettings};

// === Server ===
pub use server::{DeviceHandler, ModbusServer, ServerStats, TransportId};

// === Master ===
pub use client::{CommEventLog, ModbusMaster};

// === Device identification ===
pub use identity::{DeviceIdentification, DeviceIdentity, ReadDeviceIdCode};

// === Logging ===
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    ANY_DEVICE_ADDRESS, BROADCAST_ADDRESS, MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

/// Default master response timeout (2 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = constants::DEFAULT_RESPONSE_TIMEOUT_MS;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Ferrite Modbus v{VERSION} - Modbus RTU/ASCII/TCP protocol engine")
}
