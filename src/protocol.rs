/// Modbus protocol definitions and data structures
///
/// This module contains the application-layer definitions shared by the master
/// and server roles: function codes, exception codes, and request/response PDUs.
/// RTU framing (slave address + CRC) lives in [`crate::rtu`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BusError, BusResult};
use crate::register_map::RegisterKind;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier (1-247, 0 = broadcast)
pub type SlaveId = u8;

/// Slave address used for broadcast writes
pub const BROADCAST_SLAVE_ID: SlaveId = 0;

/// Highest assignable slave address
pub const MAX_SLAVE_ID: SlaveId = 247;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> BusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(BusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Register table addressed by this function
    pub fn register_kind(self) -> RegisterKind {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => RegisterKind::Coil,
            ModbusFunction::ReadDiscreteInputs => RegisterKind::DiscreteInput,
            ModbusFunction::ReadInputRegisters => RegisterKind::InputRegister,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => RegisterKind::HoldingRegister,
        }
    }

    /// Human-readable function name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Modbus request structure
///
/// `data` holds the function-specific payload: the packed coil bytes or the
/// big-endian register bytes for writes, empty for reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(
        slave_id: SlaveId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Write single register (0x06)
    pub fn write_single_register(slave_id: SlaveId, address: ModbusAddress, value: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Write multiple registers (0x10)
    pub fn write_multiple_registers(slave_id: SlaveId, address: ModbusAddress, values: &[u16]) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: data_utils::registers_to_bytes(values),
        }
    }

    /// Write single coil (0x05)
    pub fn write_single_coil(slave_id: SlaveId, address: ModbusAddress, value: bool) -> Self {
        let raw: u16 = if value { 0xFF00 } else { 0x0000 };
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: raw.to_be_bytes().to_vec(),
        }
    }

    /// Write multiple coils (0x0F)
    pub fn write_multiple_coils(slave_id: SlaveId, address: ModbusAddress, values: &[bool]) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: data_utils::pack_bits(values),
        }
    }

    /// Register values carried by a write request
    pub fn register_values(&self) -> BusResult<Vec<u16>> {
        data_utils::bytes_to_registers(&self.data)
    }

    /// Coil values carried by a write request
    pub fn coil_values(&self) -> Vec<bool> {
        match self.function {
            ModbusFunction::WriteSingleCoil => vec![self.data.first().copied().unwrap_or(0) == 0xFF],
            _ => data_utils::unpack_bits(&self.data, self.quantity as usize),
        }
    }

    /// Validate the request
    pub fn validate(&self) -> BusResult<()> {
        if self.slave_id > MAX_SLAVE_ID {
            return Err(BusError::invalid_data(format!("Invalid slave ID: {}", self.slave_id)));
        }

        // Broadcast only makes sense for writes; nobody answers a broadcast read
        if self.slave_id == BROADCAST_SLAVE_ID && self.function.is_read_function() {
            return Err(BusError::invalid_data("Broadcast read requests are not allowed"));
        }

        if self.quantity == 0 {
            return Err(BusError::invalid_data("Quantity cannot be zero"));
        }

        let limit = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => crate::MAX_COILS_PER_REQUEST,
            ModbusFunction::WriteMultipleCoils => crate::MAX_COILS_PER_WRITE,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                crate::MAX_REGISTERS_PER_REQUEST
            }
            ModbusFunction::WriteMultipleRegisters => crate::MAX_REGISTERS_PER_WRITE,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if self.quantity > limit {
            return Err(BusError::invalid_data(format!(
                "Too many values for {}: {} (max {})",
                self.function.name(),
                self.quantity,
                limit
            )));
        }

        if (self.address as u32 + self.quantity as u32) > 0x1_0000 {
            return Err(BusError::invalid_address(self.address, self.quantity));
        }

        Ok(())
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, exception: ModbusException) -> Self {
        Self {
            slave_id,
            function,
            data: vec![exception.to_u8()],
            exception: Some(exception),
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<BusError> {
        self.exception
            .map(|exc| BusError::exception(self.function.to_u8(), exc.to_u8()))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> BusResult<Vec<u16>> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }

        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| BusError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;

        if payload.len() < byte_count {
            return Err(BusError::frame("Incomplete register data"));
        }
        if byte_count % 2 != 0 {
            return Err(BusError::frame("Invalid register data length"));
        }

        data_utils::bytes_to_registers(&payload[..byte_count])
    }

    /// Parse response data as bits (bool values)
    ///
    /// Returns every bit of the payload; callers truncate to the requested
    /// quantity.
    pub fn parse_bits(&self) -> BusResult<Vec<bool>> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }

        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| BusError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;

        if payload.len() < byte_count {
            return Err(BusError::frame("Incomplete bit data"));
        }

        Ok(data_utils::unpack_bits(&payload[..byte_count], byte_count * 8))
    }

    /// Parse the `(address, value_or_quantity)` echo of a write response
    pub fn parse_write_echo(&self) -> BusResult<(u16, u16)> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }
        if self.data.len() < 4 {
            return Err(BusError::frame("Write echo too short"));
        }
        Ok((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> BusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(BusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes (LSB first)
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_function_register_kind() {
        assert_eq!(ModbusFunction::WriteMultipleCoils.register_kind(), RegisterKind::Coil);
        assert_eq!(ModbusFunction::ReadInputRegisters.register_kind(), RegisterKind::InputRegister);
        assert_eq!(ModbusFunction::WriteSingleRegister.register_kind(), RegisterKind::HoldingRegister);
    }

    #[test]
    fn test_request_validation() {
        let valid = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 10);
        assert!(valid.validate().is_ok());

        let broadcast_read = ModbusRequest::new_read(0, ModbusFunction::ReadHoldingRegisters, 100, 10);
        assert!(broadcast_read.validate().is_err());

        let broadcast_write = ModbusRequest::write_single_register(0, 100, 7);
        assert!(broadcast_write.validate().is_ok());

        let too_many = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 200);
        assert!(too_many.validate().is_err());

        let wraps = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 65530, 10);
        assert!(wraps.validate().is_err());
    }

    #[test]
    fn test_write_request_payloads() {
        let req = ModbusRequest::write_multiple_registers(2, 10, &[0x000A, 0x0102]);
        assert_eq!(req.quantity, 2);
        assert_eq!(req.data, vec![0x00, 0x0A, 0x01, 0x02]);
        assert_eq!(req.register_values().unwrap(), vec![0x000A, 0x0102]);

        let req = ModbusRequest::write_single_coil(2, 5, true);
        assert_eq!(req.data, vec![0xFF, 0x00]);
        assert_eq!(req.coil_values(), vec![true]);
    }

    #[test]
    fn test_response_parsing() {
        let response = ModbusResponse::new_success(
            1,
            ModbusFunction::ReadHoldingRegisters,
            vec![4, 0x12, 0x34, 0x56, 0x78],
        );
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![1, 0b1010_1010]);
        let bits = response.parse_bits().unwrap();
        assert!(!bits[0]); // LSB first
        assert!(bits[1]);
        assert!(!bits[2]);
        assert!(bits[3]);

        let response = ModbusResponse::new_exception(
            1,
            ModbusFunction::ReadHoldingRegisters,
            ModbusException::IllegalDataAddress,
        );
        assert!(matches!(
            response.parse_registers(),
            Err(BusError::Exception { code: 0x02, .. })
        ));
    }
}
