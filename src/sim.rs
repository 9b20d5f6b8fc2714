//! In-memory hardware for tests and the board simulator
//!
//! Every [`crate::hal`] trait has a deterministic stand-in here. Time only
//! moves when a test advances the [`ManualClock`], delays are recorded rather
//! than slept, and the two ends of a [`SimSerialLine::pair`] are wired to each
//! other like two transceivers on one RS485 segment.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::board::{BoardIo, DAC_MAX};
use crate::error::{BusError, BusResult};
use crate::hal::{Clock, Delay, DhcpMaintain, EthernetDriver, IoExpander, Level, LinkStatus, PinMode, SerialLine};
use crate::network::{MacAddress, StaticAddressing};
use crate::register_map::RegisterMap;
use crate::rtu::{self, FrameLen};
use crate::scheduler::PeriodicTask;
use crate::server::RtuServer;

/// Clock that only moves when told to; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ms: u64) -> Self {
        let clock = Self::new();
        clock.set(ms);
        clock
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Delay that records each call and optionally advances a clock by it
#[derive(Debug, Clone, Default)]
pub struct RecordingDelay {
    calls: Vec<u64>,
    clock: Option<ManualClock>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays also move `clock` forward, like a real blocking wait
    pub fn advancing(clock: ManualClock) -> Self {
        Self {
            calls: Vec::new(),
            clock: Some(clock),
        }
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.clone()
    }

    pub fn total_ms(&self) -> u64 {
        self.calls.iter().sum()
    }
}

impl Delay for RecordingDelay {
    fn delay_ms(&mut self, ms: u64) {
        self.calls.push(ms);
        if let Some(clock) = &self.clock {
            clock.advance(ms);
        }
    }
}

/// I/O expander that records every output write
#[derive(Debug, Clone, Default)]
pub struct SimExpander {
    modes: HashMap<u8, PinMode>,
    levels: HashMap<u8, Level>,
    writes: Vec<(u8, Level)>,
    fail: bool,
    /// Writes still allowed before the one-shot failure
    fail_after: Option<usize>,
}

impl SimExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every output write so far, in order
    pub fn writes(&self) -> &[(u8, Level)] {
        &self.writes
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.modes.get(&pin).copied()
    }

    /// Drive an input pin from the outside world
    pub fn set_input(&mut self, pin: u8, level: Level) {
        self.levels.insert(pin, level);
    }

    /// Make every following transaction fail as if the device stopped acking
    pub fn set_failing(&mut self, fail: bool) {
        self.fail = fail;
    }

    /// Let `count` more writes through, then fail exactly one
    pub fn fail_write_after(&mut self, count: usize) {
        self.fail_after = Some(count);
    }

    fn check(&self) -> BusResult<()> {
        if self.fail {
            return Err(BusError::io("I2C transaction not acknowledged"));
        }
        Ok(())
    }
}

impl IoExpander for SimExpander {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> BusResult<()> {
        self.check()?;
        self.modes.insert(pin, mode);
        Ok(())
    }

    fn digital_write(&mut self, pin: u8, level: Level) -> BusResult<()> {
        self.check()?;
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                return Err(BusError::io("I2C write not acknowledged"));
            }
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }
        self.writes.push((pin, level));
        self.levels.insert(pin, level);
        Ok(())
    }

    fn digital_read(&mut self, pin: u8) -> BusResult<Level> {
        self.check()?;
        let default = match self.modes.get(&pin) {
            Some(PinMode::InputPullup) => Level::High,
            _ => Level::Low,
        };
        Ok(self.levels.get(&pin).copied().unwrap_or(default))
    }
}

/// Scripted Ethernet controller
#[derive(Debug, Clone)]
pub struct SimEthernet {
    /// Address the DHCP server hands out; `None` makes DHCP time out
    dhcp_address: Option<Ipv4Addr>,
    link: LinkStatus,
    maintain_script: VecDeque<DhcpMaintain>,
    init_fails: bool,
    ip: Ipv4Addr,
    subnet: Ipv4Addr,
    gateway: Ipv4Addr,
    dns: Ipv4Addr,
    begin_calls: u32,
    maintain_calls: u32,
}

impl Default for SimEthernet {
    fn default() -> Self {
        Self {
            dhcp_address: Some(Ipv4Addr::new(192, 168, 1, 100)),
            link: LinkStatus::On,
            maintain_script: VecDeque::new(),
            init_fails: false,
            ip: Ipv4Addr::UNSPECIFIED,
            subnet: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns: Ipv4Addr::UNSPECIFIED,
            begin_calls: 0,
            maintain_calls: 0,
        }
    }
}

impl SimEthernet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dhcp_address(&mut self, address: Option<Ipv4Addr>) {
        self.dhcp_address = address;
    }

    pub fn set_link_status(&mut self, status: LinkStatus) {
        self.link = status;
    }

    /// Queue results for the next `maintain()` calls
    pub fn script_maintain(&mut self, outcomes: impl IntoIterator<Item = DhcpMaintain>) {
        self.maintain_script.extend(outcomes);
    }

    pub fn set_init_fails(&mut self, fails: bool) {
        self.init_fails = fails;
    }

    /// Number of address acquisitions attempted (DHCP or static)
    pub fn begin_calls(&self) -> u32 {
        self.begin_calls
    }

    pub fn maintain_calls(&self) -> u32 {
        self.maintain_calls
    }
}

impl EthernetDriver for SimEthernet {
    fn init(&mut self) -> BusResult<()> {
        if self.init_fails {
            return Err(BusError::io("Ethernet controller not responding on SPI"));
        }
        Ok(())
    }

    fn begin_dhcp(&mut self, _mac: MacAddress) -> BusResult<()> {
        self.begin_calls += 1;
        match self.dhcp_address {
            Some(ip) => {
                let [a, b, c, _] = ip.octets();
                self.ip = ip;
                self.subnet = Ipv4Addr::new(255, 255, 255, 0);
                self.gateway = Ipv4Addr::new(a, b, c, 1);
                self.dns = self.gateway;
                Ok(())
            }
            None => {
                self.ip = Ipv4Addr::UNSPECIFIED;
                Err(BusError::link_acquisition("DHCP timed out"))
            }
        }
    }

    fn begin_static(&mut self, _mac: MacAddress, addressing: &StaticAddressing) -> BusResult<()> {
        self.begin_calls += 1;
        self.ip = addressing.ip;
        self.subnet = addressing.subnet;
        self.gateway = addressing.gateway;
        self.dns = addressing.dns;
        Ok(())
    }

    fn maintain(&mut self) -> DhcpMaintain {
        self.maintain_calls += 1;
        self.maintain_script
            .pop_front()
            .unwrap_or(DhcpMaintain::NothingHappened)
    }

    fn link_status(&self) -> LinkStatus {
        self.link
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet
    }

    fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway
    }

    fn dns_server_ip(&self) -> Ipv4Addr {
        self.dns
    }
}

type ByteQueue = Arc<Mutex<VecDeque<u8>>>;

/// One end of a simulated RS485 segment
///
/// Bytes written on one end become readable on the other.
#[derive(Debug)]
pub struct SimSerialLine {
    inbox: ByteQueue,
    outbox: ByteQueue,
    tx_enabled: bool,
    tx_history: Vec<bool>,
    fail_next_write: bool,
}

impl SimSerialLine {
    /// Two cross-connected ends
    pub fn pair() -> (Self, Self) {
        let a_to_b: ByteQueue = Arc::default();
        let b_to_a: ByteQueue = Arc::default();
        (Self::new(b_to_a.clone(), a_to_b.clone()), Self::new(a_to_b, b_to_a))
    }

    fn new(inbox: ByteQueue, outbox: ByteQueue) -> Self {
        Self {
            inbox,
            outbox,
            tx_enabled: false,
            tx_history: Vec::new(),
            fail_next_write: false,
        }
    }

    /// Take every byte waiting to be read on this end
    pub fn drain_input(&mut self) -> Vec<u8> {
        self.inbox
            .lock()
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending_input(&self) -> usize {
        self.inbox.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled
    }

    /// Every direction change so far
    pub fn tx_enable_history(&self) -> Vec<bool> {
        self.tx_history.clone()
    }

    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }
}

impl SerialLine for SimSerialLine {
    fn read_available(&mut self, buf: &mut [u8]) -> BusResult<usize> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| BusError::internal("Failed to lock serial inbox"))?;
        let n = buf.len().min(inbox.len());
        for (slot, byte) in buf.iter_mut().zip(inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> BusResult<()> {
        if std::mem::take(&mut self.fail_next_write) {
            return Err(BusError::io("Simulated UART write failure"));
        }
        self.outbox
            .lock()
            .map_err(|_| BusError::internal("Failed to lock serial outbox"))?
            .extend(bytes.iter().copied());
        Ok(())
    }

    fn flush(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn set_tx_enable(&mut self, enable: bool) -> BusResult<()> {
        self.tx_enabled = enable;
        self.tx_history.push(enable);
        Ok(())
    }
}

/// Remote slave device on the far end of a simulated segment
///
/// Answers requests from its own register map, so a channel under test can
/// poll something realistic.
pub struct SimSlave {
    line: SimSerialLine,
    server: RtuServer,
    map: RegisterMap,
    rx: BytesMut,
    silent: bool,
}

impl SimSlave {
    pub fn new(line: SimSerialLine, slave_id: u8) -> Self {
        Self {
            line,
            server: RtuServer::new(slave_id),
            map: RegisterMap::new(),
            rx: BytesMut::new(),
            silent: false,
        }
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Stop answering, as if the device lost power
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn line_mut(&mut self) -> &mut SimSerialLine {
        &mut self.line
    }

    /// Answer every complete request received so far; returns replies sent
    pub fn poll(&mut self) -> BusResult<usize> {
        let input = self.line.drain_input();
        self.rx.extend_from_slice(&input);

        let mut replies = 0;
        loop {
            match rtu::request_frame_len(&self.rx) {
                FrameLen::Complete(len) => {
                    let frame = self.rx.split_to(len);
                    if self.silent {
                        continue;
                    }
                    if let Ok(Some(reply)) = self.server.handle_frame(&frame, &self.map) {
                        self.line.write_all(&reply)?;
                        replies += 1;
                    }
                }
                FrameLen::Invalid => {
                    self.rx.clear();
                    break;
                }
                FrameLen::Incomplete => break,
            }
        }
        Ok(replies)
    }
}

/// Random-walk sensor readings for the simulated board
///
/// Temperatures hover around 21 °C, humidity around 45 %, analog inputs drift
/// over the 12-bit range and a digital input toggles now and then.
pub struct DriftingSensors {
    board: BoardIo,
    rng: StdRng,
    period_ms: u64,
}

impl DriftingSensors {
    pub fn new(board: BoardIo, period_ms: u64, seed: u64) -> Self {
        Self {
            board,
            rng: StdRng::seed_from_u64(seed),
            period_ms,
        }
    }

    fn walk(rng: &mut StdRng, value: u16, center: i32, spread: i32) -> u16 {
        let current = value as i16 as i32;
        let current = if current == 0 { center } else { current };
        let next = (current + rng.gen_range(-3..=3)).clamp(center - spread, center + spread);
        next as i16 as u16
    }
}

impl PeriodicTask for DriftingSensors {
    fn name(&self) -> &str {
        "drifting-sensors"
    }

    fn period_ms(&self) -> u64 {
        self.period_ms
    }

    fn run(&mut self, _now_ms: u64) -> BusResult<()> {
        let mut state = self.board.lock()?;
        let rng = &mut self.rng;

        for input in state.inputs.iter_mut() {
            if rng.gen_bool(0.05) {
                *input = !*input;
            }
        }
        for value in state.analog.iter_mut() {
            *value = (*value as i32 + rng.gen_range(-40..=40)).clamp(0, DAC_MAX as i32) as u16;
        }
        for value in state.temperature.iter_mut() {
            *value = Self::walk(rng, *value, 215, 60);
        }
        for value in state.humidity.iter_mut() {
            *value = Self::walk(rng, *value, 450, 150);
        }
        for value in state.ds18b20.iter_mut() {
            *value = Self::walk(rng, *value, 190, 80);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ModbusFunction, ModbusRequest};
    use crate::register_map::RegisterKind;

    #[test]
    fn test_pair_is_cross_connected() {
        let (mut a, mut b) = SimSerialLine::pair();
        a.write_all(&[1, 2, 3]).unwrap();
        b.write_all(&[9]).unwrap();

        assert_eq!(b.drain_input(), vec![1, 2, 3]);
        let mut buf = [0u8; 4];
        assert_eq!(a.read_available(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn test_recording_delay_advances_clock() {
        let clock = ManualClock::starting_at(10);
        let mut delay = RecordingDelay::advancing(clock.clone());
        delay.delay_ms(200);
        delay.delay_ms(200);
        assert_eq!(clock.now_ms(), 410);
        assert_eq!(delay.total_ms(), 400);
    }

    #[test]
    fn test_expander_inputs_and_failure() {
        let mut expander = SimExpander::new();
        expander.pin_mode(3, PinMode::InputPullup).unwrap();
        assert_eq!(expander.digital_read(3).unwrap(), Level::High);
        expander.set_input(3, Level::Low);
        assert_eq!(expander.digital_read(3).unwrap(), Level::Low);

        expander.set_failing(true);
        assert!(expander.digital_write(5, Level::High).is_err());
        assert!(expander.writes().is_empty());
    }

    #[test]
    fn test_sim_slave_answers_reads() {
        let (mut master_end, slave_end) = SimSerialLine::pair();
        let mut slave = SimSlave::new(slave_end, 3);
        slave
            .register_map()
            .insert_range(RegisterKind::InputRegister, 0, 2, None)
            .unwrap();
        slave.register_map().set_value(RegisterKind::InputRegister, 1, 42).unwrap();

        let request = ModbusRequest::new_read(3, ModbusFunction::ReadInputRegisters, 0, 2);
        master_end.write_all(&rtu::encode_request(&request).unwrap()).unwrap();
        assert_eq!(slave.poll().unwrap(), 1);

        let reply = rtu::decode_response(&master_end.drain_input()).unwrap();
        assert_eq!(reply.parse_registers().unwrap(), vec![0, 42]);
    }

    #[test]
    fn test_drifting_sensors_stay_in_band() {
        let board = BoardIo::new(crate::config::RegisterLayout::default());
        let mut sensors = DriftingSensors::new(board.clone(), 2000, 7);
        for now in 0..500 {
            sensors.run(now).unwrap();
        }
        let state = board.snapshot().unwrap();
        assert!(state.temperature.iter().all(|&t| (155..=275).contains(&t)));
        assert!(state.humidity.iter().all(|&h| (300..=600).contains(&h)));
        assert!(state.analog.iter().all(|&a| a <= DAC_MAX));
    }
}
