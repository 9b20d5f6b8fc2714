//! # Controller super-loop
//!
//! [`Controller`] owns every bus-facing component and advances them in a fixed
//! order on each pass:
//!
//! 1. the Modbus channel (receive, serve, expire, then submit a due poll)
//! 2. the Ethernet link
//! 3. periodic subsystems registered with the [`PollScheduler`]
//!
//! Nothing in a pass blocks except an explicit [`Controller::begin`], which
//! includes the Ethernet reset stall.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::ModbusChannel;
use crate::client::Completion;
use crate::error::BusResult;
use crate::hal::{Clock, Delay, EthernetDriver};
use crate::network::{Addressing, LinkState, MacAddress, NetworkLink};
use crate::protocol::{ModbusFunction, ModbusRequest, SlaveId};
use crate::register_map::RegisterKind;
use crate::retry::RetryPolicy;
use crate::scheduler::{PeriodicTask, PollInterval, PollScheduler, TaskStats};
use crate::transport::BusTransport;

/// Remote block read on a fixed cadence by the master role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTarget {
    pub slave_id: SlaveId,
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
    pub period_ms: u64,
}

impl PollTarget {
    fn request(&self) -> ModbusRequest {
        let function = match self.kind {
            RegisterKind::Coil => ModbusFunction::ReadCoils,
            RegisterKind::DiscreteInput => ModbusFunction::ReadDiscreteInputs,
            RegisterKind::InputRegister => ModbusFunction::ReadInputRegisters,
            RegisterKind::HoldingRegister => ModbusFunction::ReadHoldingRegisters,
        };
        ModbusRequest::new_read(self.slave_id, function, self.start, self.count)
    }
}

struct ScheduledPoll {
    target: PollTarget,
    interval: PollInterval,
    /// Period elapsed while the bus was busy
    due: bool,
}

/// What one pass did
#[derive(Debug, Default)]
pub struct PassReport {
    /// Transaction that finished during this pass
    pub completion: Option<Completion>,
    /// Link state change observed by the network task
    pub link_change: Option<LinkState>,
    /// Periodic subsystems that ran
    pub tasks_run: usize,
}

/// Controller statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub passes: u64,
    pub bus_errors: u64,
    pub polls_submitted: u64,
    pub poll_failures: u64,
    pub link_changes: u64,
}

pub struct Controller<T, D, W, C> {
    channel: ModbusChannel<T, C>,
    link: NetworkLink<D, W, C>,
    scheduler: PollScheduler,
    polls: Vec<ScheduledPoll>,
    /// Where the next search for a due poll starts
    next_poll: usize,
    clock: C,
    retry_delay: Box<dyn Delay + Send>,
    stats: ControllerStats,
}

impl<T, D, W, C> Controller<T, D, W, C>
where
    T: BusTransport,
    D: EthernetDriver,
    W: Delay,
    C: Clock,
{
    /// `retry_delay` paces the start-up `begin()` retries
    pub fn new(
        channel: ModbusChannel<T, C>,
        link: NetworkLink<D, W, C>,
        clock: C,
        retry_delay: Box<dyn Delay + Send>,
    ) -> Self {
        Self {
            channel,
            link,
            scheduler: PollScheduler::new(),
            polls: Vec::new(),
            next_poll: 0,
            clock,
            retry_delay,
            stats: ControllerStats::default(),
        }
    }

    pub fn channel(&self) -> &ModbusChannel<T, C> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut ModbusChannel<T, C> {
        &mut self.channel
    }

    pub fn link(&self) -> &NetworkLink<D, W, C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut NetworkLink<D, W, C> {
        &mut self.link
    }

    pub fn get_stats(&self) -> ControllerStats {
        self.stats.clone()
    }

    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.scheduler.get_stats()
    }

    /// Register a periodic subsystem; its first run is one period from now
    pub fn add_task(&mut self, task: Box<dyn PeriodicTask + Send>) {
        debug!("Scheduling '{}' every {} ms", task.name(), task.period_ms());
        self.scheduler.add(task, self.clock.now_ms());
    }

    /// Poll a remote block; the first read is one period from now
    pub fn add_poll(&mut self, target: PollTarget) -> BusResult<()> {
        target.request().validate()?;
        self.polls.push(ScheduledPoll {
            target,
            interval: PollInterval::new(target.period_ms, self.clock.now_ms()),
            due: false,
        });
        Ok(())
    }

    /// Bring the Ethernet link up, retrying acquisition failures
    ///
    /// Each attempt stalls for the reset pulse. A missing reset line fails
    /// on the first attempt.
    pub fn begin(&mut self, mac: MacAddress, addressing: Addressing, policy: &RetryPolicy) -> BusResult<()> {
        let link = &mut self.link;
        policy.run(self.retry_delay.as_mut(), |attempt| {
            if attempt > 1 {
                info!("Ethernet begin attempt {}/{}", attempt, policy.max_attempts);
            }
            link.begin(mac, addressing)
        })
    }

    /// One pass of the super-loop
    pub fn poll(&mut self) -> PassReport {
        self.stats.passes += 1;
        let mut report = PassReport::default();

        if let Err(e) = self.channel.task() {
            self.stats.bus_errors += 1;
            debug!("Bus pass failed: {}", e);
        }
        if let Some(done) = self.channel.take_completion() {
            if !done.is_success() {
                self.stats.poll_failures += 1;
            }
            report.completion = Some(done);
        }
        self.submit_due_poll();

        report.link_change = self.link.task();
        if report.link_change.is_some() {
            self.stats.link_changes += 1;
        }

        report.tasks_run = self.scheduler.tick(self.clock.now_ms());
        report
    }

    /// Put at most one due poll on the bus
    ///
    /// Due polls are served round-robin from the one after the last
    /// submitted, so a slave that never answers cannot starve the rest.
    fn submit_due_poll(&mut self) {
        let now = self.clock.now_ms();
        for poll in self.polls.iter_mut() {
            if poll.interval.ready(now) {
                poll.due = true;
            }
        }
        if self.channel.is_busy() {
            return;
        }

        let len = self.polls.len();
        let Some(index) = (0..len)
            .map(|offset| (self.next_poll + offset) % len)
            .find(|&i| self.polls[i].due)
        else {
            return;
        };
        self.next_poll = (index + 1) % len;
        let poll = &mut self.polls[index];
        poll.due = false;
        let target = poll.target;
        match self.channel.submit(target.request()) {
            Ok(()) => self.stats.polls_submitted += 1,
            Err(e) => {
                self.stats.poll_failures += 1;
                warn!("Poll of slave {} failed to start: {}", target.slave_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::error::BusError;
    use crate::hal::LinkStatus;
    use crate::sim::{ManualClock, RecordingDelay, SimEthernet, SimExpander, SimSerialLine, SimSlave};
    use crate::transport::Rs485Transport;

    type TestController = Controller<Rs485Transport<SimSerialLine>, SimEthernet, RecordingDelay, ManualClock>;

    fn controller(clock: &ManualClock) -> (TestController, SimSlave) {
        let (line, remote) = SimSerialLine::pair();
        let channel = ModbusChannel::new(Rs485Transport::new(line), clock.clone(), ChannelConfig::default());
        let link = NetworkLink::new(SimEthernet::new(), RecordingDelay::new(), clock.clone());
        let controller = Controller::new(channel, link, clock.clone(), Box::new(RecordingDelay::new()));
        (controller, SimSlave::new(remote, 2))
    }

    const MAC: MacAddress = [0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED];

    #[test]
    fn test_begin_retries_until_dhcp_succeeds() {
        let clock = ManualClock::new();
        let (mut controller, _slave) = controller(&clock);
        controller.link_mut().init_reset(Box::new(SimExpander::new()), 5).unwrap();
        controller.link_mut().driver_mut().set_dhcp_address(None);

        let policy = RetryPolicy::new(2, 500);
        assert!(controller.begin(MAC, Addressing::Dhcp, &policy).is_err());
        assert_eq!(controller.link().state(), LinkState::Error);
        assert_eq!(controller.link().get_stats().begins, 2);

        controller
            .link_mut()
            .driver_mut()
            .set_dhcp_address(Some("192.168.1.100".parse().unwrap()));
        controller.begin(MAC, Addressing::Dhcp, &policy).unwrap();
        assert!(controller.link().is_connected());
    }

    #[test]
    fn test_begin_without_reset_line_fails_once() {
        let clock = ManualClock::new();
        let (mut controller, _slave) = controller(&clock);

        let err = controller.begin(MAC, Addressing::Dhcp, &RetryPolicy::new(5, 10)).unwrap_err();
        assert!(matches!(err, BusError::HardwareNotReady { .. }));
        assert_eq!(controller.link().get_stats().begins, 1);
    }

    #[test]
    fn test_poll_target_reaches_cache() {
        let clock = ManualClock::new();
        let (mut controller, mut slave) = controller(&clock);
        slave
            .register_map()
            .insert_range(RegisterKind::InputRegister, 0, 2, None)
            .unwrap();
        slave.register_map().set_value(RegisterKind::InputRegister, 1, 215).unwrap();

        controller
            .add_poll(PollTarget {
                slave_id: 2,
                kind: RegisterKind::InputRegister,
                start: 0,
                count: 2,
                period_ms: 1000,
            })
            .unwrap();

        clock.advance(1000);
        controller.poll();
        assert!(controller.channel().is_busy());

        slave.poll().unwrap();
        clock.advance(5);
        let report = controller.poll();

        let done = report.completion.unwrap();
        assert!(done.is_success());
        let cached = controller.channel().cached(2, RegisterKind::InputRegister, 1).unwrap();
        assert_eq!(cached.value, 215);
        assert!(!cached.stale);
        assert_eq!(controller.get_stats().polls_submitted, 1);
    }

    #[test]
    fn test_silent_slave_does_not_starve_other_polls() {
        let clock = ManualClock::new();
        // Only slave 3 is on the line; slave 2 never answers
        let (line, remote) = SimSerialLine::pair();
        let channel = ModbusChannel::new(Rs485Transport::new(line), clock.clone(), ChannelConfig::default());
        let link = NetworkLink::new(SimEthernet::new(), RecordingDelay::new(), clock.clone());
        let mut controller: TestController = Controller::new(channel, link, clock.clone(), Box::new(RecordingDelay::new()));
        let mut slave = SimSlave::new(remote, 3);
        slave
            .register_map()
            .insert_range(RegisterKind::HoldingRegister, 0, 1, None)
            .unwrap();
        slave.register_map().set_value(RegisterKind::HoldingRegister, 0, 33).unwrap();

        for (slave_id, period_ms) in [(2, 100), (3, 1000)] {
            controller
                .add_poll(PollTarget {
                    slave_id,
                    kind: RegisterKind::HoldingRegister,
                    start: 0,
                    count: 1,
                    period_ms,
                })
                .unwrap();
        }

        for _ in 0..600 {
            slave.poll().unwrap();
            clock.advance(10);
            controller.poll();
        }

        let cached = controller.channel().cached(3, RegisterKind::HoldingRegister, 0).unwrap();
        assert_eq!(cached.value, 33);
        assert!(controller.channel().get_stats().timeouts >= 2);
        assert!(controller.channel().metrics().successful_requests >= 2);
    }

    #[test]
    fn test_link_change_reported_in_pass() {
        let clock = ManualClock::new();
        let (mut controller, _slave) = controller(&clock);
        controller.link_mut().init_reset(Box::new(SimExpander::new()), 5).unwrap();
        controller.begin(MAC, Addressing::Dhcp, &RetryPolicy::none()).unwrap();

        controller.link_mut().driver_mut().set_link_status(LinkStatus::Off);
        clock.advance(5000);
        let report = controller.poll();
        assert_eq!(report.link_change, Some(LinkState::Disconnected));

        clock.advance(10);
        assert_eq!(controller.poll().link_change, None);
        assert_eq!(controller.get_stats().link_changes, 1);
    }

    #[test]
    fn test_invalid_poll_target_rejected() {
        let clock = ManualClock::new();
        let (mut controller, _slave) = controller(&clock);
        let target = PollTarget {
            slave_id: 2,
            kind: RegisterKind::HoldingRegister,
            start: 0,
            count: 0,
            period_ms: 1000,
        };
        assert!(controller.add_poll(target).is_err());
    }
}
