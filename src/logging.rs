//! Severity-leveled logging for the orchestration core
//!
//! Two channels exist. Library code emits `tracing` events for everything
//! operational (timeouts, discarded frames, link transitions), installed once
//! per process with [`init_tracing`]. On top of that the Modbus channel takes
//! an injected [`CallbackLogger`] for RTU traffic, so an application can route
//! bus dumps to its own sink (a debug UART, a ring buffer) without touching
//! the global subscriber.

use std::sync::Arc;

use crate::error::{BusError, BusResult};
use crate::protocol::{ModbusRequest, ModbusResponse};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw RTU frames only
    Raw,
    /// Show decoded fields only
    Interpreted,
    /// Decoded at info, raw at debug
    Both,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Forward every message into the `tracing` subscriber
    pub fn tracing() -> Self {
        let callback: LogCallback = Box::new(|level, message| match level {
            LogLevel::Error => tracing::error!(target: "cortex_link::bus", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "cortex_link::bus", "{}", message),
            LogLevel::Info => tracing::info!(target: "cortex_link::bus", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "cortex_link::bus", "{}", message),
        });
        Self::with_mode(Some(callback), LogLevel::Debug, LoggingMode::Both)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Log an outgoing request and the frame that carried it
    pub fn log_request(&self, request: &ModbusRequest, frame: &[u8]) {
        let interpreted = format!(
            "RTU Request -> Slave: {}, Function: {} (0x{:02X}), Address: {}, Quantity: {}",
            request.slave_id,
            request.function.name(),
            request.function.to_u8(),
            request.address,
            request.quantity
        );
        self.log_both("RTU Request -> Raw", interpreted, frame);
    }

    /// Log a received response and the frame that carried it
    pub fn log_response(&self, response: &ModbusResponse, frame: &[u8]) {
        let detail = match response.exception {
            Some(exception) => format!("Exception: {}", exception),
            None => interpret_response_data(response.function.to_u8(), &response.data),
        };
        let interpreted = format!(
            "RTU Response <- Slave: {}, Function: {} (0x{:02X}), {}",
            response.slave_id,
            response.function.name(),
            response.function.to_u8(),
            detail
        );
        self.log_both("RTU Response <- Raw", interpreted, frame);
    }

    /// Log a frame that was dropped
    pub fn log_discarded(&self, frame: &[u8], reason: &BusError) {
        let message = format!("RTU frame discarded ({}): {}", reason, hex::encode_upper(frame));
        self.warn(&message);
    }

    fn log_both(&self, raw_label: &str, interpreted: String, frame: &[u8]) {
        let raw = format!("{}: {}", raw_label, hex::encode_upper(frame));
        match self.mode {
            LoggingMode::Raw => self.debug(&raw),
            LoggingMode::Interpreted => self.info(&interpreted),
            LoggingMode::Both => {
                self.info(&interpreted);
                self.debug(&raw);
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Interpret response data based on function code
fn interpret_response_data(function_code: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }

    match function_code {
        0x01 | 0x02 if data.len() >= 2 => {
            let byte_count = data[0] as usize;
            let bits: Vec<u8> = data[1..]
                .iter()
                .take(byte_count)
                .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 1))
                .take(16)
                .collect();
            format!("Byte count: {}, Bits: {:?}", byte_count, bits)
        }
        0x03 | 0x04 if data.len() >= 3 => {
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .take(8)
                .collect();
            format!("Byte count: {}, Registers: {:?}", data[0], registers)
        }
        0x05 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Value: {}", address, if value == 0xFF00 { "ON" } else { "OFF" })
        }
        0x06 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        0x0F | 0x10 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let quantity = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        _ => format!("Data: {}", hex::encode(data)),
    }
}

/// Install the process-wide `tracing` subscriber
///
/// `RUST_LOG` wins over `default_filter` when it is set. Calling this twice is
/// an error, which tests can ignore.
pub fn init_tracing(default_filter: &str) -> BusResult<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| BusError::configuration(format!("Failed to initialize tracing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;
    use std::sync::Mutex;

    fn capture(level: LogLevel, mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capture(LogLevel::Warn, LoggingMode::Interpreted);
        logger.debug("dropped");
        logger.info("dropped");
        logger.warn("kept");
        logger.error("kept");
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_request_logging_modes() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 2);
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];

        let (logger, lines) = capture(LogLevel::Debug, LoggingMode::Both);
        logger.log_request(&request, &frame);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].1.contains("Read Holding Registers"));
        assert_eq!(lines[1].0, LogLevel::Debug);
        assert!(lines[1].1.ends_with("010300000002C40B"));
    }

    #[test]
    fn test_response_interpretation() {
        let text = interpret_response_data(0x03, &[4, 0x00, 0x0A, 0x00, 0x0B]);
        assert_eq!(text, "Byte count: 4, Registers: [10, 11]");
        assert_eq!(interpret_response_data(0x05, &[0, 10, 0xFF, 0]), "Address: 10, Value: ON");
    }

    #[test]
    fn test_mode_and_level_changes() {
        let request = ModbusRequest::write_single_register(2, 70, 100);
        let frame = [0x02, 0x06, 0x00, 0x46, 0x00, 0x64, 0x00, 0x00];

        let (mut logger, lines) = capture(LogLevel::Info, LoggingMode::Interpreted);
        logger.set_mode(LoggingMode::Raw);
        logger.log_request(&request, &frame);
        assert!(lines.lock().unwrap().is_empty());

        logger.set_min_level(LogLevel::Debug);
        logger.log_request(&request, &frame);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Debug);
        assert!(lines[0].1.contains("0206004600640000"));
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = CallbackLogger::disabled();
        logger.error("nothing happens");
        assert_eq!(logger.get_mode(), LoggingMode::Interpreted);
    }
}
