//! # Cortex Link Error Handling
//!
//! This module provides the error type shared by every component of the
//! orchestration core: the RS485 transport, the Modbus channel in both of its
//! roles, the register map, and the Ethernet link.
//!
//! ## Overview
//!
//! Nothing in this crate is fatal to the process. Every public operation returns
//! an explicit [`BusResult`] and the caller decides whether to retry, ignore, or
//! report. Errors never cross a component boundary as panics.
//!
//! ## Error Categories
//!
//! Every variant maps onto one [`ErrorKind`]:
//!
//! - **BusTimeout**: no response within the bound. The cached value is kept and
//!   flagged stale.
//! - **BusCorruption**: malformed, misaddressed or CRC-failed frame. Discarded
//!   and logged, never retried automatically.
//! - **RegistrationConflict**: a server range overlaps an existing entry. The
//!   registration call fails, nothing is committed.
//! - **LinkAcquisitionFailure**: DHCP or static setup failed. The link sits in
//!   `Error` until an explicit `begin()`.
//! - **HardwareNotReady**: an operation needed hardware that was never bound.
//!   Fails fast without touching any pin.
//!
//! ## Usage Examples
//!
//! ```rust
//! use cortex_link::{BusError, ErrorKind};
//!
//! let err = BusError::timeout("read holding registers", 1000);
//! assert_eq!(err.kind(), ErrorKind::BusTimeout);
//! assert!(err.is_recoverable());
//!
//! let err = BusError::hardware_not_ready("no reset line bound");
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

use crate::register_map::RegisterKind;

/// Result type alias for bus and link operations
pub type BusResult<T> = Result<T, BusError>;

/// Failure classes surfaced to the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BusTimeout,
    BusCorruption,
    RegistrationConflict,
    LinkAcquisitionFailure,
    HardwareNotReady,
    /// Well-formed exchange that the peer or the local map refused
    Protocol,
    Configuration,
    Internal,
}

/// Errors raised by the orchestration core
///
/// Each variant carries enough context to be logged on its own; callers usually
/// match on [`BusError::kind`] rather than on individual variants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// Serial line or driver I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// No valid response arrived before the deadline
    ///
    /// Includes the operation that timed out and the bound that was applied.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Frame that could not belong to the outstanding transaction
    ///
    /// # Examples
    /// - Response from slave 3 while waiting on slave 2
    /// - Function code echo that does not match the request
    /// - Truncated frame followed by line silence
    #[error("Corrupted frame: {message}")]
    Corruption { message: String },

    /// CRC validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Frame layout violation (length, byte count)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus exception response returned by a remote slave
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Unsupported function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid address/quantity combination
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Server range overlaps an already registered entry
    #[error("Registration conflict: {kind:?} address {address} already registered")]
    RegistrationConflict { kind: RegisterKind, address: u16 },

    /// A master request was submitted while another one is still outstanding
    #[error("Transaction already in flight for slave {slave_id}")]
    TransactionInFlight { slave_id: u8 },

    /// DHCP or static addressing could not produce a usable link
    #[error("Link acquisition failed: {message}")]
    LinkAcquisition { message: String },

    /// Hardware handle required by the operation was never bound
    #[error("Hardware not ready: {message}")]
    HardwareNotReady { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (lock poisoning, impossible state)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BusError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn corruption<S: Into<String>>(message: S) -> Self {
        Self::Corruption { message: message.into() }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn registration_conflict(kind: RegisterKind, address: u16) -> Self {
        Self::RegistrationConflict { kind, address }
    }

    pub fn transaction_in_flight(slave_id: u8) -> Self {
        Self::TransactionInFlight { slave_id }
    }

    pub fn link_acquisition<S: Into<String>>(message: S) -> Self {
        Self::LinkAcquisition { message: message.into() }
    }

    pub fn hardware_not_ready<S: Into<String>>(message: S) -> Self {
        Self::HardwareNotReady { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Map this error onto the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::BusTimeout,
            Self::Corruption { .. } | Self::CrcMismatch { .. } | Self::Frame { .. } => {
                ErrorKind::BusCorruption
            }
            Self::RegistrationConflict { .. } => ErrorKind::RegistrationConflict,
            Self::LinkAcquisition { .. } => ErrorKind::LinkAcquisitionFailure,
            Self::HardwareNotReady { .. } => ErrorKind::HardwareNotReady,
            Self::Exception { .. }
            | Self::InvalidFunction { .. }
            | Self::InvalidAddress { .. }
            | Self::InvalidData { .. }
            | Self::TransactionInFlight { .. } => ErrorKind::Protocol,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Io { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if the error is recoverable (a later retry may succeed)
    ///
    /// Bus and link failures are always recoverable by a future attempt.
    /// Configuration mistakes, conflicts and missing hardware are not: the same
    /// call will fail the same way until the caller changes something.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cortex_link::BusError;
    ///
    /// assert!(BusError::timeout("read", 1000).is_recoverable());
    /// assert!(BusError::link_acquisition("DHCP failed").is_recoverable());
    /// assert!(!BusError::invalid_function(0x99).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Timeout { .. } => true,
            Self::Corruption { .. } | Self::CrcMismatch { .. } | Self::Frame { .. } => true,
            Self::TransactionInFlight { .. } => true,
            Self::LinkAcquisition { .. } => true,
            // Acknowledge, Busy
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error came from the serial line rather than the protocol
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a Modbus protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::CrcMismatch { .. }
                | Self::Frame { .. }
                | Self::Exception { .. }
                | Self::InvalidFunction { .. }
        )
    }

    /// Check if the error belongs to the Ethernet side
    pub fn is_link_error(&self) -> bool {
        matches!(self, Self::LinkAcquisition { .. } | Self::HardwareNotReady { .. })
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            return Self::timeout(err.to_string(), 0);
        }
        Self::io(err.to_string())
    }
}

impl From<tokio_serial::Error> for BusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::io(format!("serial port: {}", err))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for BusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BusError::timeout("read", 1000).kind(), ErrorKind::BusTimeout);
        assert_eq!(BusError::crc_mismatch(1, 2).kind(), ErrorKind::BusCorruption);
        assert_eq!(
            BusError::registration_conflict(RegisterKind::Coil, 3).kind(),
            ErrorKind::RegistrationConflict
        );
        assert_eq!(
            BusError::link_acquisition("no lease").kind(),
            ErrorKind::LinkAcquisitionFailure
        );
        assert_eq!(
            BusError::hardware_not_ready("no line").kind(),
            ErrorKind::HardwareNotReady
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BusError::timeout("read_registers", 1000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = BusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = BusError::exception(0x03, 0x06);
        assert!(err.is_recoverable());

        assert!(BusError::hardware_not_ready("x").is_link_error());
        assert!(!BusError::hardware_not_ready("x").is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let msg = BusError::crc_mismatch(0x1234, 0x5678).to_string();
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let msg = BusError::registration_conflict(RegisterKind::HoldingRegister, 70).to_string();
        assert!(msg.contains("HoldingRegister"));
        assert!(msg.contains("70"));
    }

    #[test]
    fn test_io_timeout_maps_to_bus_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert_eq!(BusError::from(io).kind(), ErrorKind::BusTimeout);
    }
}
