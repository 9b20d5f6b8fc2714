/// Modbus RTU server role
///
/// Answers requests from external masters out of the [`RegisterMap`]. One call
/// to [`RtuServer::handle_frame`] processes one complete request frame and
/// produces at most one reply frame. Handlers run synchronously inside that
/// call.
///
/// Requests for other slave addresses are ignored without a reply. Broadcast
/// writes (slave 0) are applied and never answered.
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::protocol::{
    data_utils, ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId,
    BROADCAST_SLAVE_ID,
};
use crate::register_map::{RegisterKind, RegisterMap};
use crate::rtu;

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub requests_handled: u64,
    pub responses_sent: u64,
    pub exceptions_sent: u64,
    pub broadcasts_applied: u64,
    /// Valid frames addressed to another slave
    pub requests_ignored: u64,
}

type HandlerResult = Result<Vec<u8>, ModbusException>;

/// RTU request dispatcher bound to one slave address
#[derive(Debug, Clone)]
pub struct RtuServer {
    slave_id: SlaveId,
    stats: ServerStats,
}

impl RtuServer {
    pub fn new(slave_id: SlaveId) -> Self {
        Self {
            slave_id,
            stats: ServerStats::default(),
        }
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn set_slave_id(&mut self, slave_id: SlaveId) {
        self.slave_id = slave_id;
    }

    pub fn get_stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// Process one complete request frame
    ///
    /// Returns the encoded reply, or `None` when the request must not be
    /// answered. A frame that fails CRC or layout checks is an error.
    pub fn handle_frame(&mut self, frame: &[u8], map: &RegisterMap) -> BusResult<Option<Vec<u8>>> {
        let request = rtu::decode_request(frame)?;

        if !self.is_addressed(request.slave_id) {
            self.stats.requests_ignored += 1;
            return Ok(None);
        }
        if request.slave_id == BROADCAST_SLAVE_ID && request.function.is_read_function() {
            debug!("Ignoring broadcast {}", request.function);
            self.stats.requests_ignored += 1;
            return Ok(None);
        }

        self.stats.requests_handled += 1;
        let response = self.process_request(&request, map);

        if request.slave_id == BROADCAST_SLAVE_ID {
            self.stats.broadcasts_applied += 1;
            return Ok(None);
        }

        if response.is_exception() {
            self.stats.exceptions_sent += 1;
        } else {
            self.stats.responses_sent += 1;
        }
        Ok(Some(rtu::encode_response(&response)))
    }

    /// Answer a CRC-valid frame whose function code is not supported
    pub fn handle_unsupported(&mut self, frame: &[u8]) -> BusResult<Option<Vec<u8>>> {
        rtu::check_crc(frame)?;
        let (slave_id, function_code) = (frame[0], frame[1]);
        if !self.is_addressed(slave_id) {
            self.stats.requests_ignored += 1;
            return Ok(None);
        }

        self.stats.requests_handled += 1;
        if slave_id == BROADCAST_SLAVE_ID {
            return Ok(None);
        }
        warn!("Unsupported function code 0x{:02X} from master", function_code);
        self.stats.exceptions_sent += 1;
        Ok(Some(rtu::encode_exception(
            slave_id,
            function_code,
            ModbusException::IllegalFunction,
        )))
    }

    /// Execute a decoded request against the map and build the response
    pub fn process_request(&self, request: &ModbusRequest, map: &RegisterMap) -> ModbusResponse {
        let result = match request.function {
            ModbusFunction::ReadCoils => Self::handle_read_bits(request, map, RegisterKind::Coil),
            ModbusFunction::ReadDiscreteInputs => {
                Self::handle_read_bits(request, map, RegisterKind::DiscreteInput)
            }
            ModbusFunction::ReadHoldingRegisters => {
                Self::handle_read_registers(request, map, RegisterKind::HoldingRegister)
            }
            ModbusFunction::ReadInputRegisters => {
                Self::handle_read_registers(request, map, RegisterKind::InputRegister)
            }
            ModbusFunction::WriteSingleCoil => Self::handle_write_single_coil(request, map),
            ModbusFunction::WriteSingleRegister => Self::handle_write_single_register(request, map),
            ModbusFunction::WriteMultipleCoils => Self::handle_write_multiple_coils(request, map),
            ModbusFunction::WriteMultipleRegisters => {
                Self::handle_write_multiple_registers(request, map)
            }
        };

        match result {
            Ok(data) => ModbusResponse::new_success(request.slave_id, request.function, data),
            Err(exception) => {
                debug!(
                    "{} @ {} x{} rejected: {}",
                    request.function, request.address, request.quantity, exception
                );
                ModbusResponse::new_exception(request.slave_id, request.function, exception)
            }
        }
    }

    fn is_addressed(&self, slave_id: SlaveId) -> bool {
        slave_id == self.slave_id || slave_id == BROADCAST_SLAVE_ID
    }

    /// Handle read coils (0x01) and read discrete inputs (0x02)
    fn handle_read_bits(request: &ModbusRequest, map: &RegisterMap, kind: RegisterKind) -> HandlerResult {
        Self::check_quantity(request)?;
        let values = map
            .read_range(kind, request.address, request.quantity)
            .map_err(Self::exception_for)?;

        let bits: Vec<bool> = values.iter().map(|&v| v != 0).collect();
        let packed = data_utils::pack_bits(&bits);
        let mut response = vec![packed.len() as u8];
        response.extend_from_slice(&packed);
        Ok(response)
    }

    /// Handle read holding registers (0x03) and read input registers (0x04)
    fn handle_read_registers(request: &ModbusRequest, map: &RegisterMap, kind: RegisterKind) -> HandlerResult {
        Self::check_quantity(request)?;
        let registers = map
            .read_range(kind, request.address, request.quantity)
            .map_err(Self::exception_for)?;

        let mut response = vec![(registers.len() * 2) as u8];
        response.extend_from_slice(&data_utils::registers_to_bytes(&registers));
        Ok(response)
    }

    /// Handle write single coil (0x05)
    fn handle_write_single_coil(request: &ModbusRequest, map: &RegisterMap) -> HandlerResult {
        let value = match request.data.as_slice() {
            [0x00, 0x00] => 0,
            [0xFF, 0x00] => 1,
            _ => return Err(ModbusException::IllegalDataValue),
        };
        map.write(RegisterKind::Coil, request.address, value)
            .map_err(Self::exception_for)?;

        // Echo back the request
        Ok(Self::echo(request.address, &request.data))
    }

    /// Handle write single register (0x06)
    fn handle_write_single_register(request: &ModbusRequest, map: &RegisterMap) -> HandlerResult {
        let value = request
            .register_values()
            .ok()
            .and_then(|values| values.first().copied())
            .ok_or(ModbusException::IllegalDataValue)?;
        map.write(RegisterKind::HoldingRegister, request.address, value)
            .map_err(Self::exception_for)?;

        Ok(Self::echo(request.address, &request.data))
    }

    /// Handle write multiple coils (0x0F)
    fn handle_write_multiple_coils(request: &ModbusRequest, map: &RegisterMap) -> HandlerResult {
        Self::check_quantity(request)?;
        if request.data.len() != (request.quantity as usize + 7) / 8 {
            return Err(ModbusException::IllegalDataValue);
        }

        let values: Vec<u16> = request.coil_values().into_iter().map(u16::from).collect();
        map.write_range(RegisterKind::Coil, request.address, &values)
            .map_err(Self::exception_for)?;

        // Return address and quantity
        Ok(Self::echo(request.address, &request.quantity.to_be_bytes()))
    }

    /// Handle write multiple registers (0x10)
    fn handle_write_multiple_registers(request: &ModbusRequest, map: &RegisterMap) -> HandlerResult {
        Self::check_quantity(request)?;
        if request.data.len() != request.quantity as usize * 2 {
            return Err(ModbusException::IllegalDataValue);
        }

        let values = request
            .register_values()
            .map_err(|_| ModbusException::IllegalDataValue)?;
        map.write_range(RegisterKind::HoldingRegister, request.address, &values)
            .map_err(Self::exception_for)?;

        Ok(Self::echo(request.address, &request.quantity.to_be_bytes()))
    }

    fn check_quantity(request: &ModbusRequest) -> Result<(), ModbusException> {
        match request.validate() {
            Ok(()) => Ok(()),
            Err(BusError::InvalidAddress { .. }) => Err(ModbusException::IllegalDataAddress),
            Err(_) => Err(ModbusException::IllegalDataValue),
        }
    }

    fn exception_for(err: BusError) -> ModbusException {
        match err {
            BusError::InvalidAddress { .. } => ModbusException::IllegalDataAddress,
            BusError::InvalidData { .. } => ModbusException::IllegalDataValue,
            _ => ModbusException::ServerDeviceFailure,
        }
    }

    fn echo(address: u16, tail: &[u8]) -> Vec<u8> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(tail);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_map::RegisterHandler;
    use std::sync::Arc;

    fn map_with_registers() -> RegisterMap {
        let map = RegisterMap::new();
        map.insert_range(RegisterKind::HoldingRegister, 70, 2, None).unwrap();
        map.insert_range(RegisterKind::Coil, 10, 8, None).unwrap();
        let temperature: RegisterHandler = Arc::new(|_, _| 215);
        map.insert_range(RegisterKind::InputRegister, 30, 1, Some(temperature)).unwrap();
        map
    }

    fn request_frame(request: &ModbusRequest) -> Vec<u8> {
        rtu::encode_request(request).unwrap()
    }

    #[test]
    fn test_read_input_register_through_handler() {
        let map = map_with_registers();
        let mut server = RtuServer::new(1);
        let frame = request_frame(&ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 30, 1));

        let reply = server.handle_frame(&frame, &map).unwrap().unwrap();
        let response = rtu::decode_response(&reply).unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![215]);
        assert_eq!(server.get_stats().responses_sent, 1);
    }

    #[test]
    fn test_unmapped_address_returns_exception() {
        let map = map_with_registers();
        let mut server = RtuServer::new(1);
        let frame = request_frame(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 70, 3));

        let reply = server.handle_frame(&frame, &map).unwrap().unwrap();
        let response = rtu::decode_response(&reply).unwrap();
        assert_eq!(response.exception, Some(ModbusException::IllegalDataAddress));
        assert_eq!(server.get_stats().exceptions_sent, 1);
    }

    #[test]
    fn test_write_multiple_coils_applies_bits() {
        let map = map_with_registers();
        let mut server = RtuServer::new(1);
        let frame = request_frame(&ModbusRequest::write_multiple_coils(1, 10, &[true, false, true]));

        let reply = server.handle_frame(&frame, &map).unwrap().unwrap();
        let response = rtu::decode_response(&reply).unwrap();
        assert_eq!(response.parse_write_echo().unwrap(), (10, 3));
        assert_eq!(map.value(RegisterKind::Coil, 10), Some(1));
        assert_eq!(map.value(RegisterKind::Coil, 11), Some(0));
        assert_eq!(map.value(RegisterKind::Coil, 12), Some(1));
    }

    #[test]
    fn test_other_slave_is_ignored() {
        let map = map_with_registers();
        let mut server = RtuServer::new(1);
        let frame = request_frame(&ModbusRequest::write_single_register(9, 70, 5));

        assert_eq!(server.handle_frame(&frame, &map).unwrap(), None);
        assert_eq!(map.value(RegisterKind::HoldingRegister, 70), Some(0));
        assert_eq!(server.get_stats().requests_ignored, 1);
    }

    #[test]
    fn test_broadcast_write_applied_without_reply() {
        let map = map_with_registers();
        let mut server = RtuServer::new(1);
        let frame = request_frame(&ModbusRequest::write_single_register(0, 71, 1234));

        assert_eq!(server.handle_frame(&frame, &map).unwrap(), None);
        assert_eq!(map.value(RegisterKind::HoldingRegister, 71), Some(1234));
        assert_eq!(server.get_stats().broadcasts_applied, 1);
    }

    #[test]
    fn test_invalid_coil_value_rejected() {
        let map = map_with_registers();
        let mut server = RtuServer::new(1);
        let mut request = ModbusRequest::write_single_coil(1, 10, true);
        request.data = vec![0x12, 0x34];
        let frame = request_frame(&request);

        let reply = server.handle_frame(&frame, &map).unwrap().unwrap();
        assert_eq!(&reply[..3], &[0x01, 0x85, 0x03]);
    }

    #[test]
    fn test_unsupported_function() {
        let mut server = RtuServer::new(1);
        let mut frame = vec![0x01, 0x2B, 0x0E, 0x01, 0x00];
        let crc = rtu::calculate_crc(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let reply = server.handle_unsupported(&frame).unwrap().unwrap();
        assert_eq!(&reply[..3], &[0x01, 0xAB, 0x01]);
    }
}
