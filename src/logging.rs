//! Logging system for the library
//!
//! The engine logs through [`tracing`] by default. Embedders that cannot
//! install a tracing subscriber (FFI hosts, GUIs with their own log panes)
//! can instead register a [`CallbackLogger`] on a master or server and
//! receive formatted request/response lines directly.

use std::fmt;
use std::sync::Arc;

/// Severity of a logged line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        write!(f, "{name}")
    }
}

/// Callback receiving `(level, message)` pairs.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Where log lines go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoggingMode {
    /// Drop everything.
    Disabled,
    /// Forward to the `tracing` macros.
    Tracing,
    /// Invoke the registered callback.
    Callback,
}

/// Logger handed to masters and servers for traffic logging.
#[derive(Clone)]
pub struct CallbackLogger {
    mode: LoggingMode,
    callback: Option<LogCallback>,
}

impl CallbackLogger {
    /// Logger forwarding to `tracing`.
    pub fn new() -> Self {
        Self {
            mode: LoggingMode::Tracing,
            callback: None,
        }
    }

    /// Logger invoking `callback` for every line.
    pub fn with_callback(callback: LogCallback) -> Self {
        Self {
            mode: LoggingMode::Callback,
            callback: Some(callback),
        }
    }

    /// Logger that drops everything.
    pub fn disabled() -> Self {
        Self {
            mode: LoggingMode::Disabled,
            callback: None,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Emit one line.
    pub fn log(&self, level: LogLevel, message: &str) {
        match self.mode {
            LoggingMode::Disabled => {}
            LoggingMode::Tracing => match level {
                LogLevel::Error => tracing::error!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Trace => tracing::trace!("{message}"),
            },
            LoggingMode::Callback => {
                if let Some(ref callback) = self.callback {
                    callback(level, message);
                }
            }
        }
    }

    /// Log an outgoing request PDU.
    pub fn log_request(&self, address: u8, function: u8, data: &[u8]) {
        if self.mode == LoggingMode::Disabled {
            return;
        }
        self.log(
            LogLevel::Debug,
            &format!(
                "request addr={} fc=0x{:02X} data=[{}]",
                address,
                function,
                format_hex(data)
            ),
        );
    }

    /// Log a received response PDU.
    pub fn log_response(&self, address: u8, function: u8, data: &[u8]) {
        if self.mode == LoggingMode::Disabled {
            return;
        }
        self.log(
            LogLevel::Debug,
            &format!(
                "response addr={} fc=0x{:02X} data=[{}]",
                address,
                function,
                format_hex(data)
            ),
        );
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("mode", &self.mode)
            .finish()
    }
}

/// Format raw bytes as a spaced upper-case hex string.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
