//! Hardware seams consumed by the orchestration core.
//!
//! Every peripheral the core touches is reached through one of these traits
//! and handed to the component that owns it at construction time. The board
//! build implements them over the real UART, GPIO expander and W5500 driver;
//! [`crate::host`] implements them for a Linux host and [`crate::sim`] in
//! memory for tests.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::error::{BusError, BusResult};
use crate::network::{MacAddress, StaticAddressing};

/// Monotonic millisecond clock
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Blocking delay, used only for the bounded Ethernet reset stall
pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

/// Digital pin direction on an I/O expander
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    InputPullup,
    Output,
}

/// Digital pin level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Bus-addressed I/O expander (MCP23017 on the board)
///
/// Each call is one complete bus transaction.
pub trait IoExpander {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> BusResult<()>;
    fn digital_write(&mut self, pin: u8, level: Level) -> BusResult<()>;
    fn digital_read(&mut self, pin: u8) -> BusResult<Level>;
}

impl<T: IoExpander + ?Sized> IoExpander for Box<T> {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> BusResult<()> {
        (**self).pin_mode(pin, mode)
    }

    fn digital_write(&mut self, pin: u8, level: Level) -> BusResult<()> {
        (**self).digital_write(pin, level)
    }

    fn digital_read(&mut self, pin: u8) -> BusResult<Level> {
        (**self).digital_read(pin)
    }
}

/// Clonable handle to an expander shared by several components
///
/// The digital-input expander also carries the Ethernet reset line, so the
/// input driver and [`crate::network::NetworkLink`] both hold a handle. The
/// lock is taken for exactly one transaction, which keeps partial I2C
/// transactions from interleaving.
pub struct SharedExpander<E> {
    inner: Arc<Mutex<E>>,
}

impl<E> SharedExpander<E> {
    pub fn new(expander: E) -> Self {
        Self {
            inner: Arc::new(Mutex::new(expander)),
        }
    }

    /// Run several operations as one uninterrupted transaction
    pub fn with<R>(&self, f: impl FnOnce(&mut E) -> R) -> BusResult<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| BusError::internal("Failed to lock expander"))?;
        Ok(f(&mut guard))
    }
}

impl<E> Clone for SharedExpander<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: IoExpander> IoExpander for SharedExpander<E> {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> BusResult<()> {
        self.with(|e| e.pin_mode(pin, mode))?
    }

    fn digital_write(&mut self, pin: u8, level: Level) -> BusResult<()> {
        self.with(|e| e.digital_write(pin, level))?
    }

    fn digital_read(&mut self, pin: u8) -> BusResult<Level> {
        self.with(|e| e.digital_read(pin))?
    }
}

/// Half-duplex serial line behind an RS485 transceiver
pub trait SerialLine {
    /// Read whatever is already buffered, without blocking; `Ok(0)` when idle
    fn read_available(&mut self, buf: &mut [u8]) -> BusResult<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> BusResult<()>;

    /// Block until the last byte has left the shift register
    fn flush(&mut self) -> BusResult<()>;

    /// Drive the transceiver direction line (high = transmit)
    fn set_tx_enable(&mut self, enable: bool) -> BusResult<()>;
}

/// Physical carrier state reported by the Ethernet PHY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Unknown,
    On,
    Off,
}

/// Result of a DHCP lease maintenance call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMaintain {
    NothingHappened,
    RenewFailed,
    RenewSuccess,
    RebindFailed,
    RebindSuccess,
}

/// Ethernet controller (W5500 over SPI on the board)
pub trait EthernetDriver {
    /// Bring up the SPI link to the controller chip
    fn init(&mut self) -> BusResult<()>;

    /// Acquire an address by DHCP
    fn begin_dhcp(&mut self, mac: MacAddress) -> BusResult<()>;

    fn begin_static(&mut self, mac: MacAddress, addressing: &StaticAddressing) -> BusResult<()>;

    fn maintain(&mut self) -> DhcpMaintain;

    fn link_status(&self) -> LinkStatus;

    fn local_ip(&self) -> Ipv4Addr;
    fn subnet_mask(&self) -> Ipv4Addr;
    fn gateway_ip(&self) -> Ipv4Addr;
    fn dns_server_ip(&self) -> Ipv4Addr;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimExpander;

    #[test]
    fn test_shared_expander_handles_see_same_device() {
        let shared = SharedExpander::new(SimExpander::new());
        let mut a = shared.clone();
        let mut b = shared.clone();

        a.pin_mode(5, PinMode::Output).unwrap();
        b.digital_write(5, Level::High).unwrap();

        assert_eq!(a.digital_read(5).unwrap(), Level::High);
        let writes = shared.with(|e| e.writes().len()).unwrap();
        assert_eq!(writes, 1);
    }
}
