//! Modbus protocol constants based on official specification
//!
//! These constants are derived from the Modbus Application Protocol v1.1b:
//! - Maximum PDU size: 253 bytes (inherited from the RS485 ADU limit of 256)
//! - Register/coil limits are calculated to fit within the PDU size constraint
//! - ASCII frames carry two hex characters per raw byte plus `':'` and CR LF

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// The Unit ID that follows is counted by the Length field, not by this.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Device Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum PDU data size (PDU minus the function code byte).
///
/// This is the default `max_data_len` for transports.
pub const MAX_PDU_DATA_SIZE: usize = MAX_PDU_SIZE - 1;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum RTU ADU: address + function + data + CRC
pub const MAX_RTU_ADU_LEN: usize = 256;

/// Maximum TCP ADU: MBAP header + unit id + PDU
pub const MAX_TCP_ADU_LEN: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

/// Maximum ASCII ADU: `':'` + 2 hex chars per raw byte (addr + fc + data +
/// LRC) + CR + LF = 1 + 2 * (1 + 1 + 252 + 1) + 2 = 513 bytes
pub const MAX_ASCII_ADU_LEN: usize = 1 + 2 * (MAX_PDU_SIZE + 2) + 2;

// ============================================================================
// Device Addressing
// ============================================================================

/// Broadcast address. The server executes the request but never replies.
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest unicast device address.
pub const MAX_UNICAST_ADDRESS: u8 = 247;

/// "Accept any unit id" address, a Modbus/TCP convention. A server
/// constructed with this address answers every unit id; 249..=255 remain
/// reserved.
pub const ANY_DEVICE_ADDRESS: u8 = 248;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: 1 (fc) + 1 (byte count) + N * 2 <= 253, so N <= 125.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: 1 + 2 + 2 + 1 + N * 2 <= 253, so N <= 123.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum registers on either side of FC23 (Read/Write Multiple Registers).
pub const MAX_READ_WRITE_REGISTERS: u16 = 121;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
pub const MAX_READ_COILS: u16 = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
pub const MAX_WRITE_COILS: u16 = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Read Exception Status (FC07, serial line, master side only here)
pub const FC_READ_EXCEPTION_STATUS: u8 = 0x07;

/// Diagnostics (FC08, master side only here)
pub const FC_DIAGNOSTICS: u8 = 0x08;

/// Get Comm Event Counter (FC11, master side only here)
pub const FC_GET_COMM_EVENT_COUNTER: u8 = 0x0B;

/// Get Comm Event Log (FC12, master side only here)
pub const FC_GET_COMM_EVENT_LOG: u8 = 0x0C;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Read/Write Multiple Registers (FC23)
pub const FC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;

/// Encapsulated Interface Transport (FC43)
pub const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;

/// MEI type for Read Device Identification under FC43
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Bit set on the echoed function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Coil Values On The Wire (FC05)
// ============================================================================

/// FC05 payload meaning "coil ON"
pub const COIL_ON: u16 = 0xFF00;

/// FC05 payload meaning "coil OFF"
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Timing
// ============================================================================

/// Baud rates above this use the fixed inter-frame gap instead of 3.5
/// character times.
pub const FIXED_GAP_BAUD_THRESHOLD: u32 = 19_200;

/// Fixed RTU inter-frame gap above [`FIXED_GAP_BAUD_THRESHOLD`], microseconds.
pub const FIXED_INTER_FRAME_GAP_US: u64 = 1_750;

/// Per-frame read ceiling of the server poll loop, milliseconds.
pub const SERVER_RECEIVE_TIMEOUT_MS: u64 = 1_000;

/// Sleep between server poll sweeps, milliseconds.
pub const SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default master response timeout, milliseconds.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;

/// Default master timeout for device-identification reads, milliseconds.
pub const DEFAULT_DEVICE_ID_TIMEOUT_MS: u64 = 4_000;
