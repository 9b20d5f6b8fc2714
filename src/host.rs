//! Linux host bindings for the hardware seams
//!
//! Lets the orchestration core run on a PC with a USB-RS485 adapter. Only the
//! serial line has a real counterpart here; the Ethernet driver and expander
//! stay simulated on hosted builds.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tokio_serial::{DataBits, SerialPort, StopBits};
use tracing::info;

use crate::board::{BoardIo, BoardSampler};
use crate::channel::ModbusChannel;
use crate::config::{ControllerConfig, Parity, SerialConfig};
use crate::controller::Controller;
use crate::error::{BusError, BusResult};
use crate::hal::{Clock, Delay, SerialLine, SharedExpander};
use crate::logging::CallbackLogger;
use crate::network::NetworkLink;
use crate::sim::{DriftingSensors, SimEthernet, SimExpander};
use crate::transport::BusTransport;

/// Serial port opened through `tokio_serial`'s synchronous builder
pub struct HostSerialLine {
    port: Box<dyn SerialPort>,
    rts_direction: bool,
}

impl HostSerialLine {
    pub fn open(config: &SerialConfig) -> BusResult<Self> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(BusError::configuration(format!("Unsupported data bits: {}", other)))
            }
        };
        let stop_bits = match config.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(BusError::configuration(format!("Unsupported stop bits: {}", other)))
            }
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };

        let port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(10))
            .open()?;

        info!(
            "Opened serial port {} at {} baud ({:?} parity)",
            config.port, config.baud_rate, config.parity
        );

        Ok(Self {
            port,
            rts_direction: config.rts_direction,
        })
    }

    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl SerialLine for HostSerialLine {
    fn read_available(&mut self, buf: &mut [u8]) -> BusResult<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let len = pending.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> BusResult<()> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> BusResult<()> {
        self.port.flush()?;
        Ok(())
    }

    fn set_tx_enable(&mut self, enable: bool) -> BusResult<()> {
        // Adapters with automatic direction control need no RTS toggling
        if self.rts_direction {
            self.port.write_request_to_send(enable)?;
        }
        Ok(())
    }
}

/// Milliseconds since the clock was created
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Blocks the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Controller with simulated Ethernet and expander, real time
pub type HostController<T> = Controller<T, SimEthernet, ThreadDelay, SystemClock>;

/// Assemble a controller around `transport` from the configuration
///
/// Exposes `board` on the register map, binds the Ethernet reset line on a
/// simulated expander and schedules sensor sampling and the configured polls.
/// The link is not started; call [`Controller::begin`].
pub fn build_controller<T: BusTransport>(
    config: &ControllerConfig,
    transport: T,
    board: &BoardIo,
) -> BusResult<HostController<T>> {
    let clock = SystemClock::new();

    let logger = if config.logging.bus_log {
        CallbackLogger::tracing()
    } else {
        CallbackLogger::disabled()
    };
    let mut channel = ModbusChannel::with_logger(transport, clock, config.modbus.clone(), logger);
    board.expose(&mut channel)?;
    let map = channel.register_map().clone();

    let mut link = NetworkLink::with_timings(SimEthernet::new(), ThreadDelay, clock, config.ethernet.timings());
    let expander = SharedExpander::new(SimExpander::new());
    link.init_reset(Box::new(expander), config.ethernet.reset_pin)?;

    let mut controller = Controller::new(channel, link, clock, Box::new(ThreadDelay));
    let sensor_period = config.scheduler.sensor_interval_ms;
    controller.add_task(Box::new(DriftingSensors::new(board.clone(), sensor_period, rand::random())));
    controller.add_task(Box::new(BoardSampler::new(board.clone(), map, sensor_period)));
    for poll in &config.polls {
        controller.add_poll(*poll)?;
    }
    Ok(controller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        ThreadDelay.delay_ms(5);
        assert!(clock.now_ms() >= first + 5);
    }

    #[test]
    fn test_build_controller_from_defaults() {
        let config = ControllerConfig::default();
        let (line, _bus) = crate::sim::SimSerialLine::pair();
        let board = BoardIo::new(config.registers.clone());

        let controller = build_controller(&config, crate::transport::Rs485Transport::new(line), &board).unwrap();
        assert_eq!(controller.task_stats().len(), 2);
        assert!(controller.link().has_reset_line());
        assert!(controller
            .channel()
            .roles()
            .contains(crate::channel::ModbusRole::Server));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig {
            port: "/dev/does-not-exist-cortex".to_string(),
            ..SerialConfig::default()
        };
        assert!(HostSerialLine::open(&config).is_err());
    }

    #[test]
    fn test_unsupported_framing_rejected_before_open() {
        let config = SerialConfig {
            stop_bits: 3,
            ..SerialConfig::default()
        };
        let err = HostSerialLine::open(&config).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
