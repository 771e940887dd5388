//! Core error types and result handling
//!
//! Errors fall into three groups:
//!
//! 1. **Wire errors** detected by a framer: CRC/LRC mismatch, truncated
//!    frames, framing violations. The server clears its input and drops the
//!    frame; the master surfaces them to the caller.
//! 2. **Protocol exceptions**: a well-formed request the device cannot serve.
//!    On the server side these are encoded as exception responses
//!    (`fc | 0x80`, one code byte); on the master side a received exception
//!    response becomes [`ModbusError::Exception`].
//! 3. **Orchestration errors**: timeouts, lost connections, configuration
//!    mistakes. Never transmitted on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus exception codes as transmitted in exception responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Convert from the wire byte. Unknown codes map to `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    /// The wire byte for this exception.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable description from the specification.
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "function code is not an allowable action for the server",
            Self::IllegalDataAddress => "data address is not an allowable address for the server",
            Self::IllegalDataValue => "a value in the request is not allowable for the server",
            Self::ServerDeviceFailure => "unrecoverable error while performing the requested action",
            Self::Acknowledge => "request accepted, long-duration processing in progress",
            Self::ServerDeviceBusy => "server busy with a long-duration command",
            Self::MemoryParityError => "parity error detected reading record file",
            Self::GatewayPathUnavailable => "gateway could not allocate an internal path",
            Self::GatewayTargetFailedToRespond => "no response from the gateway target device",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Errors produced by the framing, dispatch and correlation layers.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// The device answered with a Modbus exception response.
    #[error("Modbus exception for function 0x{function:02X}: {code}")]
    Exception { function: u8, code: ExceptionCode },

    /// The device answered with an exception response carrying a code
    /// outside the specification.
    #[error("Modbus exception for function 0x{function:02X}: unknown code 0x{code:02X}")]
    UnknownException { function: u8, code: u8 },

    /// No matching response within the allowed window.
    #[error("timeout during {operation} after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// RTU CRC-16 check failed.
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// ASCII LRC check failed.
    #[error("LRC mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    LrcMismatch { expected: u8, actual: u8 },

    /// A frame ended before the minimum length for its shape.
    #[error("response too short: {length} bytes")]
    ResponseTooShort { length: usize },

    /// Framing violation not covered by a more specific variant.
    #[error("frame error: {message}")]
    Frame { message: String },

    /// Protocol-level violation in an otherwise well-framed message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Function code not understood by this engine.
    #[error("invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request or response content out of bounds.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Transport could not be reached or was lost.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Construction-time parameter problem.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Underlying I/O failure.
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl ModbusError {
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Build the error for a received exception response.
    pub fn exception(function: u8, code: u8) -> Self {
        match ExceptionCode::from_u8(code) {
            Some(code) => Self::Exception {
                function: function & 0x7F,
                code,
            },
            None => Self::UnknownException {
                function: function & 0x7F,
                code,
            },
        }
    }

    /// True for errors the master correlator treats as "keep waiting":
    /// a corrupted or foreign frame inside the timeout window.
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            Self::CrcMismatch { .. }
                | Self::LrcMismatch { .. }
                | Self::ResponseTooShort { .. }
                | Self::Frame { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}
