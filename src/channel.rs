//! # Modbus RTU channel
//!
//! [`ModbusChannel`] owns the RS485 transport and the local register map and
//! plays both Modbus roles on the same half-duplex line:
//!
//! - **Master**: polls external slaves. Requests are submitted and then
//!   advanced by [`ModbusChannel::task`]; nothing blocks.
//! - **Server**: answers external masters from the register map. The role is
//!   added by the first range registration and never removed.
//!
//! While a master transaction is awaiting its response, every received frame
//! is treated as that response. Otherwise received frames are requests.
//!
//! ## Example
//!
//! ```rust
//! use cortex_link::channel::{ChannelConfig, ModbusChannel};
//! use cortex_link::sim::{ManualClock, SimSerialLine};
//! use cortex_link::transport::Rs485Transport;
//!
//! let (line, _bus) = SimSerialLine::pair();
//! let clock = ManualClock::new();
//! let mut channel = ModbusChannel::new(Rs485Transport::new(line), clock.clone(), ChannelConfig::default());
//!
//! channel.register_holding_range(70, 2, |_addr, value| value.min(4095)).unwrap();
//! channel.read_registers(2, 0, 4).unwrap();
//!
//! clock.advance(1000);
//! channel.task().unwrap();
//! let done = channel.take_completion().unwrap();
//! assert!(done.result.is_err());
//! ```

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::client::{Completion, FrameVerdict, MasterReply, MasterState, RtuMaster};
use crate::error::{BusError, BusResult};
use crate::hal::Clock;
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusFunction, ModbusRequest, SlaveId};
use crate::register_map::{CachedRegister, RegisterHandler, RegisterKind, RegisterMap, RemoteCache};
use crate::rtu::{self, FrameLen};
use crate::server::{RtuServer, ServerStats};
use crate::transport::BusTransport;
use crate::utils::TransactionMetrics;

/// Capability a channel can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusRole {
    Master,
    Server,
}

/// Set of roles a channel currently holds
///
/// Master is always present. Server is added once and never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSet {
    server: bool,
}

impl RoleSet {
    pub fn master_only() -> Self {
        Self { server: false }
    }

    pub fn contains(self, role: ModbusRole) -> bool {
        match role {
            ModbusRole::Master => true,
            ModbusRole::Server => self.server,
        }
    }

    fn escalate(&mut self, role: ModbusRole) -> bool {
        match role {
            ModbusRole::Master => false,
            ModbusRole::Server => !std::mem::replace(&mut self.server, true),
        }
    }
}

impl Default for RoleSet {
    fn default() -> Self {
        Self::master_only()
    }
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Address this device answers to as a server
    pub slave_id: SlaveId,
    /// Bound on one master transaction
    pub response_timeout_ms: u64,
    /// Line speed, used to derive the inter-frame silence
    pub baud_rate: u32,
    /// Hex dumps of every frame at debug level
    pub packet_logging: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            slave_id: 1,
            response_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            baud_rate: 9600,
            packet_logging: false,
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub exceptions_received: u64,
    pub timeouts: u64,
    pub send_failures: u64,
    /// Frames dropped for CRC, layout, address or function mismatch
    pub corrupt_frames: u64,
    /// Bytes received while neither role could use them
    pub unsolicited_frames: u64,
    /// Server replies that could not be written to the line
    pub reply_failures: u64,
    /// Responses from other slaves passed over in the server role
    pub foreign_frames: u64,
    /// Bytes dropped while hunting for the next frame boundary
    pub resync_bytes: u64,
}

/// Dual-role Modbus RTU channel
pub struct ModbusChannel<T, C> {
    transport: T,
    clock: C,
    config: ChannelConfig,
    roles: RoleSet,
    map: RegisterMap,
    server: RtuServer,
    master: RtuMaster,
    cache: RemoteCache,
    rx: BytesMut,
    last_rx_ms: u64,
    frame_gap_ms: u64,
    logger: CallbackLogger,
    stats: ChannelStats,
    metrics: TransactionMetrics,
}

impl<T: BusTransport, C: Clock> ModbusChannel<T, C> {
    pub fn new(transport: T, clock: C, config: ChannelConfig) -> Self {
        Self::with_logger(transport, clock, config, CallbackLogger::disabled())
    }

    /// Create a channel that reports bus traffic through `logger`
    pub fn with_logger(transport: T, clock: C, config: ChannelConfig, logger: CallbackLogger) -> Self {
        let now = clock.now_ms();
        Self {
            transport,
            clock,
            roles: RoleSet::master_only(),
            map: RegisterMap::new(),
            server: RtuServer::new(config.slave_id),
            master: RtuMaster::new(config.response_timeout_ms),
            cache: RemoteCache::new(),
            rx: BytesMut::with_capacity(crate::MAX_RTU_FRAME_SIZE),
            last_rx_ms: now,
            frame_gap_ms: rtu::frame_gap_ms(config.baud_rate),
            logger,
            stats: ChannelStats::default(),
            metrics: TransactionMetrics::new(),
            config,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn roles(&self) -> RoleSet {
        self.roles
    }

    /// Change the address answered as a server
    pub fn set_slave_id(&mut self, slave_id: SlaveId) {
        self.config.slave_id = slave_id;
        self.server.set_slave_id(slave_id);
    }

    /// Handle to the local register map
    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn master_state(&self) -> &MasterState {
        self.master.state()
    }

    pub fn get_stats(&self) -> ChannelStats {
        self.stats.clone()
    }

    pub fn server_stats(&self) -> ServerStats {
        self.server.get_stats()
    }

    pub fn metrics(&self) -> &TransactionMetrics {
        &self.metrics
    }

    // ------------------------------------------------------------------
    // Master role
    // ------------------------------------------------------------------

    /// Read holding registers (function code 0x03)
    pub fn read_registers(&mut self, slave_id: SlaveId, start: u16, count: u16) -> BusResult<()> {
        self.submit(ModbusRequest::new_read(
            slave_id,
            ModbusFunction::ReadHoldingRegisters,
            start,
            count,
        ))
    }

    /// Read input registers (function code 0x04)
    pub fn read_input_registers(&mut self, slave_id: SlaveId, start: u16, count: u16) -> BusResult<()> {
        self.submit(ModbusRequest::new_read(
            slave_id,
            ModbusFunction::ReadInputRegisters,
            start,
            count,
        ))
    }

    /// Read coils (function code 0x01)
    pub fn read_coils(&mut self, slave_id: SlaveId, start: u16, count: u16) -> BusResult<()> {
        self.submit(ModbusRequest::new_read(slave_id, ModbusFunction::ReadCoils, start, count))
    }

    /// Read discrete inputs (function code 0x02)
    pub fn read_discrete_inputs(&mut self, slave_id: SlaveId, start: u16, count: u16) -> BusResult<()> {
        self.submit(ModbusRequest::new_read(
            slave_id,
            ModbusFunction::ReadDiscreteInputs,
            start,
            count,
        ))
    }

    /// Write single register (function code 0x06)
    pub fn write_register(&mut self, slave_id: SlaveId, address: u16, value: u16) -> BusResult<()> {
        self.submit(ModbusRequest::write_single_register(slave_id, address, value))
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_registers(&mut self, slave_id: SlaveId, start: u16, values: &[u16]) -> BusResult<()> {
        if values.is_empty() || values.len() > crate::MAX_REGISTERS_PER_WRITE as usize {
            return Err(BusError::invalid_data(format!(
                "Register write needs 1-{} values, got {}",
                crate::MAX_REGISTERS_PER_WRITE,
                values.len()
            )));
        }
        self.submit(ModbusRequest::write_multiple_registers(slave_id, start, values))
    }

    /// Write single coil (function code 0x05)
    pub fn write_coil(&mut self, slave_id: SlaveId, address: u16, value: bool) -> BusResult<()> {
        self.submit(ModbusRequest::write_single_coil(slave_id, address, value))
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_coils(&mut self, slave_id: SlaveId, start: u16, values: &[bool]) -> BusResult<()> {
        if values.is_empty() || values.len() > crate::MAX_COILS_PER_WRITE as usize {
            return Err(BusError::invalid_data(format!(
                "Coil write needs 1-{} values, got {}",
                crate::MAX_COILS_PER_WRITE,
                values.len()
            )));
        }
        self.submit(ModbusRequest::write_multiple_coils(slave_id, start, values))
    }

    /// Put a request on the bus and start its transaction
    ///
    /// Fails with `TransactionInFlight` while another request is outstanding.
    /// A send failure also finishes the transaction, so the error is visible
    /// both here and through [`ModbusChannel::take_completion`].
    pub fn submit(&mut self, request: ModbusRequest) -> BusResult<()> {
        let now = self.clock.now_ms();
        let frame = self.master.submit(request.clone(), now)?;
        self.logger.log_request(&request, &frame);

        // Leftovers from before this transaction cannot be its response
        if !self.rx.is_empty() {
            self.discard_rx(BusError::corruption("Stale bytes before new transaction"));
        }

        if let Err(e) = self.transport.send(&frame) {
            warn!("Failed to send {} to slave {}: {}", request.function, request.slave_id, e);
            self.stats.send_failures += 1;
            self.metrics.record_failure(0);
            self.master.fail(e.clone(), now);
            return Err(e);
        }
        self.stats.requests_sent += 1;
        Ok(())
    }

    /// Take the most recent finished transaction
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.master.take_completion()
    }

    /// Whether a master transaction is awaiting its response
    pub fn is_busy(&self) -> bool {
        self.master.is_awaiting()
    }

    /// Last known value of a remote register
    pub fn cached(&self, slave_id: SlaveId, kind: RegisterKind, address: u16) -> Option<CachedRegister> {
        self.cache.get(slave_id, kind, address)
    }

    pub fn remote_cache(&self) -> &RemoteCache {
        &self.cache
    }

    // ------------------------------------------------------------------
    // Server role
    // ------------------------------------------------------------------

    /// Expose `count` holding registers starting at `start`
    pub fn register_holding_range<F>(&mut self, start: u16, count: u16, handler: F) -> BusResult<()>
    where
        F: Fn(u16, u16) -> u16 + Send + Sync + 'static,
    {
        self.register_range(RegisterKind::HoldingRegister, start, count, Some(Arc::new(handler)))
    }

    /// Expose `count` input registers starting at `start`
    pub fn register_input_range<F>(&mut self, start: u16, count: u16, handler: F) -> BusResult<()>
    where
        F: Fn(u16, u16) -> u16 + Send + Sync + 'static,
    {
        self.register_range(RegisterKind::InputRegister, start, count, Some(Arc::new(handler)))
    }

    /// Expose `count` coils starting at `start`
    pub fn register_coil_range<F>(&mut self, start: u16, count: u16, handler: F) -> BusResult<()>
    where
        F: Fn(u16, u16) -> u16 + Send + Sync + 'static,
    {
        self.register_range(RegisterKind::Coil, start, count, Some(Arc::new(handler)))
    }

    /// Expose `count` discrete inputs starting at `start`
    pub fn register_discrete_range<F>(&mut self, start: u16, count: u16, handler: F) -> BusResult<()>
    where
        F: Fn(u16, u16) -> u16 + Send + Sync + 'static,
    {
        self.register_range(RegisterKind::DiscreteInput, start, count, Some(Arc::new(handler)))
    }

    /// Expose a range backed only by stored values (see [`RegisterMap::set_value`])
    pub fn register_range(
        &mut self,
        kind: RegisterKind,
        start: u16,
        count: u16,
        handler: Option<RegisterHandler>,
    ) -> BusResult<()> {
        if self.roles.escalate(ModbusRole::Server) {
            debug!("Channel now answering as slave {}", self.config.slave_id);
        }

        if let Err(e) = self.map.insert_range(kind, start, count, handler) {
            error!("Failed to register {} range {}..+{}: {}", kind, start, count, e);
            self.logger.error(&format!("Register range rejected: {}", e));
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pump
    // ------------------------------------------------------------------

    /// One non-blocking pass over the bus
    ///
    /// Drains received bytes, completes or discards frames, serves requests
    /// and expires the outstanding transaction. Must run every loop pass.
    /// Only a receive failure on the line is returned; everything else is
    /// handled and logged here.
    pub fn task(&mut self) -> BusResult<()> {
        let now = self.clock.now_ms();

        let received = self.transport.receive(&mut self.rx);
        if let Ok(n) = received {
            if n > 0 {
                self.last_rx_ms = now;
            }
        }

        self.process_rx(now);

        if self.master.check_timeout(now) {
            self.on_timeout();
        }

        // A partial frame followed by silence will never complete
        if !self.rx.is_empty() && now.saturating_sub(self.last_rx_ms) >= self.frame_gap_ms {
            self.discard_rx(BusError::corruption("Truncated frame followed by line silence"));
        }

        received.map(|_| ()).map_err(|e| {
            warn!("RS485 receive failed: {}", e);
            e
        })
    }

    fn process_rx(&mut self, now: u64) {
        while !self.rx.is_empty() {
            if self.master.is_awaiting() {
                match rtu::response_frame_len(&self.rx) {
                    FrameLen::Incomplete => break,
                    FrameLen::Invalid => {
                        self.discard_rx(BusError::corruption("Unrecognized response header"));
                        break;
                    }
                    FrameLen::Complete(len) => {
                        let frame = self.rx.split_to(len);
                        self.on_response_frame(&frame, now);
                    }
                }
            } else if self.roles.contains(ModbusRole::Server) {
                match rtu::request_frame_len(&self.rx) {
                    FrameLen::Incomplete => {
                        // A 0x0F/0x10 write ack from another slave is shorter than the request
                        match self.foreign_response_len() {
                            Some(len) => self.skip_foreign_response(len),
                            None => break,
                        }
                    }
                    FrameLen::Invalid => {
                        if let Some(len) = self.foreign_response_len() {
                            self.skip_foreign_response(len);
                            continue;
                        }
                        // Unknown function: the frame ends where the line goes quiet
                        if now.saturating_sub(self.last_rx_ms) >= self.frame_gap_ms {
                            let frame = self.rx.split();
                            let reply = self.server.handle_unsupported(&frame);
                            self.finish_request(&frame, reply);
                        }
                        break;
                    }
                    FrameLen::Complete(len) if rtu::check_crc(&self.rx[..len]).is_ok() => {
                        let frame = self.rx.split_to(len);
                        let reply = self.server.handle_frame(&frame, &self.map);
                        self.finish_request(&frame, reply);
                    }
                    FrameLen::Complete(_) => {
                        if let Some(len) = self.foreign_response_len() {
                            self.skip_foreign_response(len);
                        } else if rtu::response_frame_len(&self.rx) == FrameLen::Incomplete {
                            // Possibly a longer response from another slave still arriving
                            break;
                        } else {
                            self.rx.advance(1);
                            self.stats.resync_bytes += 1;
                        }
                    }
                }
            } else {
                debug!("Dropping {} unsolicited bytes", self.rx.len());
                self.stats.unsolicited_frames += 1;
                self.rx.clear();
            }
        }
    }

    fn on_response_frame(&mut self, frame: &[u8], now: u64) {
        match self.master.on_frame(frame, now) {
            FrameVerdict::Completed => {
                self.stats.responses_received += 1;
                if let Ok(response) = rtu::decode_response(frame) {
                    self.logger.log_response(&response, frame);
                }
                self.apply_completion(now);
            }
            FrameVerdict::Discarded(reason) => {
                warn!("Discarding RTU frame: {}", reason);
                self.stats.corrupt_frames += 1;
                self.logger.log_discarded(frame, &reason);
            }
            FrameVerdict::Unsolicited => {
                self.stats.unsolicited_frames += 1;
            }
        }
    }

    /// Fold a completed transaction into the cache and metrics
    fn apply_completion(&mut self, now: u64) {
        let MasterState::Complete(completion) = self.master.state() else {
            return;
        };
        let request = &completion.request;

        match &completion.result {
            Ok(reply) => {
                self.metrics.record_success(completion.elapsed_ms);
                let values = match reply {
                    MasterReply::WriteAck { .. } => match request.function {
                        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils => {
                            Some(request.coil_values().into_iter().map(u16::from).collect())
                        }
                        _ => request.register_values().ok(),
                    },
                    other => other.cache_values(),
                };
                if let Some(values) = values {
                    self.cache.update(
                        request.slave_id,
                        request.function.register_kind(),
                        request.address,
                        &values,
                        now,
                    );
                }
            }
            Err(e) => {
                self.metrics.record_failure(completion.elapsed_ms);
                if let BusError::Exception { .. } = e {
                    self.stats.exceptions_received += 1;
                }
                warn!("Slave {} answered {} with error: {}", request.slave_id, request.function, e);
            }
        }
    }

    fn on_timeout(&mut self) {
        let MasterState::TimedOut(completion) = self.master.state() else {
            return;
        };
        let request = &completion.request;

        self.stats.timeouts += 1;
        self.metrics.record_failure(completion.elapsed_ms);
        if request.function.is_read_function() {
            self.cache
                .mark_stale(request.slave_id, request.function.register_kind(), request.address, request.quantity);
        }

        let message = format!(
            "No response from slave {} to {} within {}ms",
            request.slave_id,
            request.function,
            self.master.response_timeout_ms()
        );
        warn!("{}", message);
        self.logger.warn(&message);
    }

    fn finish_request(&mut self, frame: &[u8], reply: BusResult<Option<Vec<u8>>>) {
        match reply {
            Ok(Some(reply)) => {
                if let Err(e) = self.transport.send(&reply) {
                    warn!("Failed to send server reply: {}", e);
                    self.stats.reply_failures += 1;
                }
            }
            Ok(None) => {}
            Err(reason) => {
                warn!("Discarding RTU request: {}", reason);
                self.stats.corrupt_frames += 1;
                self.logger.log_discarded(frame, &reason);
            }
        }
    }

    /// Length of a CRC-valid response to another master transaction at the head of the buffer
    fn foreign_response_len(&self) -> Option<usize> {
        match rtu::response_frame_len(&self.rx) {
            FrameLen::Complete(len) if rtu::check_crc(&self.rx[..len]).is_ok() => Some(len),
            _ => None,
        }
    }

    fn skip_foreign_response(&mut self, len: usize) {
        let frame = self.rx.split_to(len);
        trace!("Skipping response from slave {} to another master", frame[0]);
        self.stats.foreign_frames += 1;
    }

    fn discard_rx(&mut self, reason: BusError) {
        let frame = self.rx.split();
        warn!("Discarding {} buffered bytes: {}", frame.len(), reason);
        self.stats.corrupt_frames += 1;
        self.logger.log_discarded(&frame, &reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SerialLine;
    use crate::protocol::ModbusResponse;
    use crate::sim::{ManualClock, SimSerialLine};
    use crate::transport::Rs485Transport;

    type TestChannel = ModbusChannel<Rs485Transport<SimSerialLine>, ManualClock>;

    fn channel() -> (TestChannel, SimSerialLine, ManualClock) {
        let (line, bus) = SimSerialLine::pair();
        let clock = ManualClock::new();
        let channel = ModbusChannel::new(Rs485Transport::new(line), clock.clone(), ChannelConfig::default());
        (channel, bus, clock)
    }

    fn registers_response(slave: u8, values: &[u16]) -> Vec<u8> {
        let mut data = vec![(values.len() * 2) as u8];
        for v in values {
            data.extend_from_slice(&v.to_be_bytes());
        }
        rtu::encode_response(&ModbusResponse::new_success(
            slave,
            ModbusFunction::ReadHoldingRegisters,
            data,
        ))
    }

    #[test]
    fn test_role_escalation_is_one_way() {
        let (mut channel, _bus, _clock) = channel();
        assert!(!channel.roles().contains(ModbusRole::Server));
        assert!(channel.roles().contains(ModbusRole::Master));

        channel.register_input_range(30, 2, |_, v| v).unwrap();
        assert!(channel.roles().contains(ModbusRole::Server));

        assert!(channel.register_input_range(31, 1, |_, v| v).is_err());
        assert!(channel.roles().contains(ModbusRole::Server));
    }

    #[test]
    fn test_read_completes_and_updates_cache() {
        let (mut channel, mut bus, clock) = channel();
        channel.read_registers(2, 0, 2).unwrap();
        assert_eq!(bus.drain_input(), rtu::encode_request(&ModbusRequest::new_read(2, ModbusFunction::ReadHoldingRegisters, 0, 2)).unwrap());

        clock.advance(30);
        bus.write_all(&registers_response(2, &[215, 480])).unwrap();
        channel.task().unwrap();

        let completion = channel.take_completion().unwrap();
        assert_eq!(completion.result, Ok(MasterReply::Registers(vec![215, 480])));
        let cached = channel.cached(2, RegisterKind::HoldingRegister, 1).unwrap();
        assert_eq!(cached.value, 480);
        assert!(!cached.stale);
        assert_eq!(channel.get_stats().responses_received, 1);
    }

    #[test]
    fn test_response_split_across_passes() {
        let (mut channel, mut bus, clock) = channel();
        channel.read_registers(2, 0, 1).unwrap();
        let frame = registers_response(2, &[7]);

        bus.write_all(&frame[..3]).unwrap();
        channel.task().unwrap();
        assert!(channel.is_busy());

        clock.advance(1);
        bus.write_all(&frame[3..]).unwrap();
        channel.task().unwrap();
        assert!(!channel.is_busy());
        assert!(channel.take_completion().unwrap().is_success());
    }

    #[test]
    fn test_in_flight_rejects_second_request() {
        let (mut channel, _bus, _clock) = channel();
        channel.read_registers(2, 0, 1).unwrap();
        assert!(matches!(
            channel.write_register(3, 0, 1),
            Err(BusError::TransactionInFlight { slave_id: 2 })
        ));
    }

    #[test]
    fn test_truncated_frame_dropped_after_silence() {
        let (mut channel, mut bus, clock) = channel();
        channel.read_registers(2, 0, 2).unwrap();

        bus.write_all(&[0x02, 0x03, 0x04, 0x00]).unwrap();
        channel.task().unwrap();
        clock.advance(10);
        channel.task().unwrap();

        assert_eq!(channel.get_stats().corrupt_frames, 1);
        assert!(channel.is_busy());
    }

    #[test]
    fn test_server_answers_when_idle() {
        let (mut channel, mut bus, _clock) = channel();
        channel.register_holding_range(70, 2, |_, value| value).unwrap();
        channel.register_map().set_value(RegisterKind::HoldingRegister, 70, 3300).unwrap();

        let request = rtu::encode_request(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 70, 1)).unwrap();
        bus.write_all(&request).unwrap();
        channel.task().unwrap();

        let reply = rtu::decode_response(&bus.drain_input()).unwrap();
        assert_eq!(reply.parse_registers().unwrap(), vec![3300]);
        assert_eq!(channel.server_stats().responses_sent, 1);
    }

    #[test]
    fn test_server_skips_other_slave_response_on_shared_bus() {
        let (mut channel, mut bus, _clock) = channel();
        channel.register_holding_range(70, 1, |_, value| value).unwrap();
        channel.register_map().set_value(RegisterKind::HoldingRegister, 70, 42).unwrap();

        // Another master's exchange with slave 5 is still in the buffer when our request lands
        let mut traffic = registers_response(5, &[0x1234, 0x5678]);
        traffic.extend(rtu::encode_request(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 70, 1)).unwrap());
        bus.write_all(&traffic).unwrap();
        channel.task().unwrap();

        let reply = rtu::decode_response(&bus.drain_input()).unwrap();
        assert_eq!(reply.parse_registers().unwrap(), vec![42]);
        let stats = channel.get_stats();
        assert_eq!(stats.foreign_frames, 1);
        assert_eq!(stats.corrupt_frames, 0);
    }

    #[test]
    fn test_server_resyncs_after_line_noise() {
        let (mut channel, mut bus, _clock) = channel();
        channel.register_holding_range(70, 1, |_, value| value).unwrap();

        let mut traffic = vec![0xFF];
        traffic.extend(rtu::encode_request(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 70, 1)).unwrap());
        bus.write_all(&traffic).unwrap();
        channel.task().unwrap();

        assert!(rtu::decode_response(&bus.drain_input()).is_ok());
        assert_eq!(channel.get_stats().resync_bytes, 1);
        assert_eq!(channel.server_stats().responses_sent, 1);
    }

    #[test]
    fn test_master_only_channel_drops_requests() {
        let (mut channel, mut bus, _clock) = channel();
        let request = rtu::encode_request(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 70, 1)).unwrap();
        bus.write_all(&request).unwrap();
        channel.task().unwrap();

        assert!(bus.drain_input().is_empty());
        assert_eq!(channel.get_stats().unsolicited_frames, 1);
    }

    #[test]
    fn test_write_registers_updates_cache_on_ack() {
        let (mut channel, mut bus, _clock) = channel();
        channel.write_registers(4, 10, &[1, 2]).unwrap();
        bus.drain_input();

        let mut echo = vec![];
        echo.extend_from_slice(&10u16.to_be_bytes());
        echo.extend_from_slice(&2u16.to_be_bytes());
        let ack = rtu::encode_response(&ModbusResponse::new_success(4, ModbusFunction::WriteMultipleRegisters, echo));
        bus.write_all(&ack).unwrap();
        channel.task().unwrap();

        assert_eq!(channel.cached(4, RegisterKind::HoldingRegister, 11).unwrap().value, 2);
    }
}
