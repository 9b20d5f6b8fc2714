//! Controller configuration
//!
//! Read-only start-up settings for the serial line, the Modbus channel, the
//! Ethernet link and the control loop. Every field has a default equal to the
//! board's factory value, so an empty file is a valid configuration.
//!
//! ```yaml
//! serial:
//!   port: /dev/ttyUSB0
//!   baud_rate: 19200
//! modbus:
//!   slave_id: 3
//! ethernet:
//!   mac: "DE:AD:BE:EF:FE:ED"
//!   addressing:
//!     mode: static
//!     ip: 192.168.1.50
//!     gateway: 192.168.1.1
//!     subnet: 255.255.255.0
//!     dns: 8.8.8.8
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::controller::PollTarget;
use crate::error::{BusError, BusResult};
use crate::network::{
    Addressing, LinkTimings, MacAddress, DEFAULT_CHECK_INTERVAL_MS, DEFAULT_RESET_DURATION_MS,
    DEFAULT_RESET_PIN,
};
use crate::retry::RetryPolicy;
use crate::utils::validation;

/// Complete controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub serial: SerialConfig,
    pub modbus: ChannelConfig,
    pub ethernet: EthernetConfig,
    pub registers: RegisterLayout,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    /// Remote blocks read periodically by the master role
    pub polls: Vec<PollTarget>,
}

/// RS485 serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0")
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Drive the transceiver direction through RTS
    #[serde(default)]
    pub rts_direction: bool,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            rts_direction: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Ethernet link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EthernetConfig {
    /// Colon-separated hardware address
    pub mac: String,
    pub addressing: Addressing,
    /// Expander pin wired to the controller reset input
    pub reset_pin: u8,
    /// I2C address of the expander carrying the reset line
    pub expander_address: u8,
    pub reset_duration_ms: u64,
    pub check_interval_ms: u64,
    /// Attempts for the start-up `begin()`
    pub begin_retry: RetryPolicy,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        Self {
            mac: "DE:AD:BE:EF:FE:ED".to_string(),
            addressing: Addressing::Dhcp,
            reset_pin: DEFAULT_RESET_PIN,
            expander_address: 0x21,
            reset_duration_ms: DEFAULT_RESET_DURATION_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            begin_retry: RetryPolicy::new(3, 1000),
        }
    }
}

impl EthernetConfig {
    /// Parse `mac` into bytes
    pub fn mac_address(&self) -> BusResult<MacAddress> {
        let parts: Vec<&str> = self.mac.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(BusError::configuration(format!("Invalid MAC address: {}", self.mac)));
        }
        let mut mac = [0u8; 6];
        for (byte, part) in mac.iter_mut().zip(parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| BusError::configuration(format!("Invalid MAC address: {}", self.mac)))?;
        }
        Ok(mac)
    }

    pub fn timings(&self) -> LinkTimings {
        LinkTimings {
            check_interval_ms: self.check_interval_ms,
            reset_duration_ms: self.reset_duration_ms,
        }
    }
}

/// Where each group of local I/O appears in the server register map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterLayout {
    /// Digital inputs, discrete inputs
    pub inputs_start: u16,
    pub input_count: u16,
    /// Relay outputs, coils
    pub relays_start: u16,
    pub relay_count: u16,
    /// Analog inputs, input registers
    pub analog_start: u16,
    pub analog_count: u16,
    /// Temperature in tenths of a degree, input registers
    pub temperature_start: u16,
    /// Relative humidity in tenths of a percent, input registers
    pub humidity_start: u16,
    pub dht_count: u16,
    /// One-wire temperature probes, input registers
    pub ds18b20_start: u16,
    pub ds18b20_count: u16,
    /// Analog outputs, holding registers
    pub dac_start: u16,
    pub dac_count: u16,
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self {
            inputs_start: 0,
            input_count: 8,
            relays_start: 10,
            relay_count: 8,
            analog_start: 20,
            analog_count: 4,
            temperature_start: 30,
            humidity_start: 40,
            dht_count: 2,
            ds18b20_start: 50,
            ds18b20_count: 4,
            dac_start: 70,
            dac_count: 2,
        }
    }
}

/// Control loop pacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between loop passes on hosted builds
    pub loop_period_ms: u64,
    /// Cadence of the master poll of remote slaves
    pub poll_interval_ms: u64,
    /// Cadence of local sensor sampling
    pub sensor_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            loop_period_ms: 10,
            poll_interval_ms: 1000,
            sensor_interval_ms: 2000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset
    pub level: String,
    /// Route RTU traffic through the callback logger
    pub bus_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            bus_log: false,
        }
    }
}

impl ControllerConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file and validate
    pub fn from_file(path: impl AsRef<Path>) -> BusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BusError::configuration(format!("Failed to read {}: {}", path.display(), e)))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            _ => {
                return Err(BusError::configuration(format!(
                    "Unsupported config format: {}",
                    path.display()
                )))
            }
        };
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> BusResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> BusResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> BusResult<()> {
        if self.serial.baud_rate == 0 {
            return Err(BusError::configuration("baud_rate must be > 0"));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(BusError::configuration(format!(
                "data_bits must be 5-8, got {}",
                self.serial.data_bits
            )));
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(BusError::configuration(format!(
                "stop_bits must be 1 or 2, got {}",
                self.serial.stop_bits
            )));
        }

        validation::validate_slave_id(self.modbus.slave_id)
            .map_err(|e| BusError::configuration(e.to_string()))?;
        if self.modbus.response_timeout_ms == 0 {
            return Err(BusError::configuration("response_timeout_ms must be > 0"));
        }
        if self.modbus.baud_rate != self.serial.baud_rate {
            return Err(BusError::configuration(format!(
                "modbus.baud_rate ({}) differs from serial.baud_rate ({})",
                self.modbus.baud_rate, self.serial.baud_rate
            )));
        }

        let mac = self.ethernet.mac_address()?;
        validation::validate_mac(&mac)?;
        if let Addressing::Static(settings) = &self.ethernet.addressing {
            validation::validate_host_ip(settings.ip)?;
        }
        if self.ethernet.reset_pin > 15 {
            return Err(BusError::configuration(format!(
                "reset_pin must be 0-15, got {}",
                self.ethernet.reset_pin
            )));
        }
        if self.ethernet.reset_duration_ms == 0 || self.ethernet.check_interval_ms == 0 {
            return Err(BusError::configuration("Ethernet durations must be > 0"));
        }
        self.ethernet.begin_retry.validate()?;

        let scheduler = &self.scheduler;
        if scheduler.loop_period_ms == 0 || scheduler.poll_interval_ms == 0 || scheduler.sensor_interval_ms == 0 {
            return Err(BusError::configuration("Scheduler periods must be > 0"));
        }

        for poll in &self.polls {
            if poll.period_ms == 0 {
                return Err(BusError::configuration(format!(
                    "Poll of slave {} needs a period > 0",
                    poll.slave_id
                )));
            }
            if poll.slave_id == self.modbus.slave_id {
                return Err(BusError::configuration(format!(
                    "Poll target {} is this device's own slave ID",
                    poll.slave_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    #[test]
    fn test_empty_yaml_gives_board_defaults() {
        let config = ControllerConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.modbus.slave_id, 1);
        assert_eq!(config.modbus.response_timeout_ms, 1000);
        assert_eq!(config.ethernet.reset_pin, 5);
        assert_eq!(config.ethernet.check_interval_ms, 5000);
        assert_eq!(config.registers.dac_start, 70);
        assert!(config.polls.is_empty());
    }

    #[test]
    fn test_poll_targets_from_yaml() {
        let yaml = r#"
polls:
  - slave_id: 2
    kind: input_register
    start: 0
    count: 4
    period_ms: 1000
"#;
        let config = ControllerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.polls.len(), 1);
        assert_eq!(config.polls[0].kind, crate::register_map::RegisterKind::InputRegister);

        let own_id = "polls:\n  - {slave_id: 1, kind: coil, start: 0, count: 1, period_ms: 500}\n";
        assert!(ControllerConfig::from_yaml_str(own_id).is_err());
    }

    #[test]
    fn test_static_addressing_from_yaml() {
        let yaml = r#"
ethernet:
  mac: "02:00:00:00:00:01"
  addressing:
    mode: static
    ip: 10.0.0.20
    gateway: 10.0.0.1
    subnet: 255.255.255.0
    dns: 10.0.0.1
"#;
        let config = ControllerConfig::from_yaml_str(yaml).unwrap();
        match config.ethernet.addressing {
            Addressing::Static(settings) => assert_eq!(settings.ip, Ipv4Addr::new(10, 0, 0, 20)),
            Addressing::Dhcp => panic!("expected static addressing"),
        }
        assert_eq!(config.ethernet.mac_address().unwrap(), [0x02, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ControllerConfig::from_yaml_str("modbus:\n  slave_id: 0\n").is_err());
        assert!(ControllerConfig::from_yaml_str("modbus:\n  response_timeout_ms: 0\n").is_err());
        assert!(ControllerConfig::from_yaml_str("ethernet:\n  mac: \"zz\"\n").is_err());

        let yaml = "ethernet:\n  addressing:\n    mode: static\n    ip: 0.0.0.0\n    gateway: 0.0.0.0\n    subnet: 0.0.0.0\n    dns: 0.0.0.0\n";
        assert!(ControllerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_json_file_loading() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"serial": {{"port": "/dev/ttyS1", "baud_rate": 19200}}, "modbus": {{"baud_rate": 19200, "slave_id": 7}}}}"#
        )
        .unwrap();

        let config = ControllerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyS1");
        assert_eq!(config.modbus.slave_id, 7);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let err = ControllerConfig::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
