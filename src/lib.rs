//! # Cortex Link - Multi-bus orchestration core
//!
//! Firmware core of the Cortex Link A8R-M controller. It bridges the board's
//! local I/O to two communication rails:
//!
//! - an RS485 **Modbus RTU** bus, where the board is at once a master polling
//!   external slaves and a server exposing its own registers;
//! - an **Ethernet** uplink whose controller is reset through an I/O expander
//!   before it acquires an address by DHCP or static configuration.
//!
//! Everything runs on one thread. A super-loop calls each component's
//! non-blocking `task()` in a fixed order and every periodic job gates itself
//! with a [`scheduler::PollInterval`].
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
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust
//! use cortex_link::channel::{ChannelConfig, ModbusChannel};
//! use cortex_link::network::{Addressing, NetworkLink};
//! use cortex_link::sim::{ManualClock, RecordingDelay, SimEthernet, SimExpander, SimSerialLine};
//! use cortex_link::transport::Rs485Transport;
//! use cortex_link::LinkState;
//!
//! let clock = ManualClock::new();
//!
//! // Server role: expose a DAC output as holding registers 70..72
//! let (line, _bus) = SimSerialLine::pair();
//! let mut channel = ModbusChannel::new(Rs485Transport::new(line), clock.clone(), ChannelConfig::default());
//! channel.register_holding_range(70, 2, |_addr, value| value.min(4095)).unwrap();
//!
//! // Ethernet: bind the reset line, then bring the link up over DHCP
//! let mut link = NetworkLink::new(SimEthernet::new(), RecordingDelay::new(), clock.clone());
//! link.init_reset(Box::new(SimExpander::new()), 5).unwrap();
//! link.begin([0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED], Addressing::Dhcp).unwrap();
//! assert_eq!(link.status().0, LinkState::Connected);
//!
//! // Control loop pass
//! channel.task().unwrap();
//! link.task();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Controller (super-loop)                │
//! └──────────────────────────────────────────────────────────┘
//!        │ 1                      │ 2                  │ 3
//! ┌───────────────┐      ┌─────────────────┐   ┌──────────────┐
//! │ ModbusChannel │      │   NetworkLink   │   │ PollScheduler│
//! │ master+server │      │ reset/DHCP/link │   │  periodic    │
//! └───────────────┘      └─────────────────┘   └──────────────┘
//!     │         │               │          │
//! ┌───────┐ ┌───────────┐  ┌──────────┐ ┌────────────┐
//! │ RS485 │ │RegisterMap│  │ Ethernet │ │  Expander  │
//! │ line  │ │ handlers  │  │  driver  │ │ reset line │
//! └───────┘ └───────────┘  └──────────┘ └────────────┘
//! ```

/// Error taxonomy and result alias
pub mod error;

/// Modbus PDU definitions and message handling
pub mod protocol;

/// RTU framing and CRC
pub mod rtu;

/// Hardware seams: clock, delay, serial line, expander, Ethernet driver
pub mod hal;

/// Local register table and remote value cache
pub mod register_map;

/// RS485 transport with direction control
pub mod transport;

/// Server-side request dispatch
pub mod server;

/// Master transaction state machine
pub mod client;

/// Dual-role Modbus channel
pub mod channel;

/// Ethernet link state machine
pub mod network;

/// Cooperative timing
pub mod scheduler;

/// Bounded retries
pub mod retry;

/// Local I/O mapped onto the register layout
pub mod board;

/// Super-loop tying the components together
pub mod controller;

/// Start-up configuration
pub mod config;

/// Logging system for the library
pub mod logging;

/// Utility functions and transaction metrics
pub mod utils;

/// In-memory hardware for tests and the simulated controller
pub mod sim;

/// Linux host bindings
pub mod host;

// Re-export main types for convenience
pub use channel::{ChannelConfig, ChannelStats, ModbusChannel, ModbusRole, RoleSet};
pub use client::{Completion, MasterReply, MasterState};
pub use config::ControllerConfig;
pub use controller::{Controller, PollTarget};
pub use error::{BusError, BusResult, ErrorKind};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use network::{Addressing, LinkState, NetworkLink, StaticAddressing};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse};
pub use register_map::{RegisterKind, RegisterMap};
pub use scheduler::{PeriodicTask, PollInterval, PollScheduler};
pub use transport::{BusTransport, Rs485Transport, TransportStats};

/// Bound on one master transaction
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Maximum number of coils or discrete inputs read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of coils written in a single request
pub const MAX_COILS_PER_WRITE: u16 = 1968;

/// Maximum number of registers read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of registers written in a single request
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Cortex Link v{} - Modbus RTU and Ethernet orchestration core", VERSION)
}
