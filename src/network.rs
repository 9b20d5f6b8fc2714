//! # Ethernet link management
//!
//! [`NetworkLink`] owns the Ethernet controller driver and walks the link
//! through its lifecycle:
//!
//! ```text
//!                 begin()                 addressing ok
//!  Disconnected ──────────▶ Connecting ─────────────────▶ Connected
//!       ▲                       │                           │   ▲
//!       │                       │ reset / DHCP / static     │   │
//!       │                       ▼ failure                   │   │
//!       │                     Error ◀── (only begin()       │   │
//!       │                               leaves Error)       │   │
//!       └──────────── carrier lost (task) ◀─────────────────┘   │
//!       └──────────── carrier back (task) ──────────────────────┘
//! ```
//!
//! The controller chip is reset through a digital output on the I/O expander
//! before every `begin()`. The reset pulse is a deliberate blocking stall of
//! `2 × reset_duration_ms` (400 ms with the default pulse): the line is held
//! low for one duration, released, and the chip is given one more duration to
//! stabilize. Nothing else in the control loop runs meanwhile, so `begin()`
//! belongs in start-up or explicit recovery paths, never in the periodic pass.
//!
//! The periodic [`NetworkLink::task`] only renews the DHCP lease and follows
//! the physical carrier; it never re-runs `begin()` and never leaves `Error`.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};
use crate::hal::{Clock, Delay, DhcpMaintain, EthernetDriver, IoExpander, Level, LinkStatus, PinMode};
use crate::scheduler::PollInterval;
use crate::utils::{format, validation};

/// Six-byte hardware address
pub type MacAddress = [u8; 6];

/// Default link check cadence
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 5000;

/// Default reset pulse (low time, and again stabilization time)
pub const DEFAULT_RESET_DURATION_MS: u64 = 200;

/// Expander pin wired to the Ethernet controller reset input
pub const DEFAULT_RESET_PIN: u8 = 5;

/// Ethernet connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Fixed IPv4 settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAddressing {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// How the link obtains its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Addressing {
    Dhcp,
    Static(StaticAddressing),
}

impl Addressing {
    pub fn is_dhcp(&self) -> bool {
        matches!(self, Addressing::Dhcp)
    }
}

/// Link timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    pub check_interval_ms: u64,
    pub reset_duration_ms: u64,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            reset_duration_ms: DEFAULT_RESET_DURATION_MS,
        }
    }
}

/// Link statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub begins: u64,
    pub begin_failures: u64,
    pub resets: u64,
    pub link_losses: u64,
    pub link_recoveries: u64,
    pub dhcp_renewals: u64,
    pub dhcp_failures: u64,
}

struct ResetLine {
    expander: Box<dyn IoExpander + Send>,
    pin: u8,
}

/// Ethernet link state machine
pub struct NetworkLink<D, W, C> {
    driver: D,
    delay: W,
    clock: C,
    reset_line: Option<ResetLine>,
    state: LinkState,
    /// Set by the last successful `begin()`
    addressing: Option<Addressing>,
    mac: Option<MacAddress>,
    interval: PollInterval,
    timings: LinkTimings,
    stats: LinkStats,
}

impl<D: EthernetDriver, W: Delay, C: Clock> NetworkLink<D, W, C> {
    pub fn new(driver: D, delay: W, clock: C) -> Self {
        Self::with_timings(driver, delay, clock, LinkTimings::default())
    }

    pub fn with_timings(driver: D, delay: W, clock: C, timings: LinkTimings) -> Self {
        let interval = PollInterval::new(timings.check_interval_ms, clock.now_ms());
        Self {
            driver,
            delay,
            clock,
            reset_line: None,
            state: LinkState::Disconnected,
            addressing: None,
            mac: None,
            interval,
            timings,
            stats: LinkStats::default(),
        }
    }

    /// Bind the expander output wired to the controller reset input
    ///
    /// Configures the pin as an output and drives it high (not in reset). The
    /// line is bound only if both writes succeed.
    pub fn init_reset(&mut self, mut expander: Box<dyn IoExpander + Send>, pin: u8) -> BusResult<()> {
        expander.pin_mode(pin, PinMode::Output)?;
        expander.digital_write(pin, Level::High)?;
        debug!("Ethernet reset bound to expander pin {}", pin);
        self.reset_line = Some(ResetLine { expander, pin });
        Ok(())
    }

    pub fn has_reset_line(&self) -> bool {
        self.reset_line.is_some()
    }

    /// Pulse the controller reset line
    ///
    /// Blocks for `2 × reset_duration_ms`. Fails with `HardwareNotReady`
    /// without touching any pin when no line is bound.
    pub fn reset(&mut self) -> BusResult<()> {
        let duration = self.timings.reset_duration_ms;
        let line = self
            .reset_line
            .as_mut()
            .ok_or_else(|| BusError::hardware_not_ready("Ethernet reset line not bound"))?;

        line.expander.digital_write(line.pin, Level::Low)?;
        self.delay.delay_ms(duration);
        if let Err(e) = line.expander.digital_write(line.pin, Level::High) {
            // The controller must not stay held in reset
            warn!("Failed to release Ethernet reset: {}", e);
            if let Err(retry) = line.expander.digital_write(line.pin, Level::High) {
                warn!("Ethernet controller may still be held in reset: {}", retry);
            }
            return Err(e);
        }
        self.delay.delay_ms(duration);

        self.stats.resets += 1;
        debug!("Ethernet controller reset ({}ms pulse)", duration);
        Ok(())
    }

    /// Reset the controller and acquire an address
    ///
    /// On success the link is `Connected`. Any failure leaves it in `Error`,
    /// which only another `begin()` can clear.
    pub fn begin(&mut self, mac: MacAddress, addressing: Addressing) -> BusResult<()> {
        validation::validate_mac(&mac)?;

        self.stats.begins += 1;
        self.state = LinkState::Connecting;
        info!("Starting Ethernet link ({})", format::mac_to_string(&mac));

        match self.acquire(mac, &addressing) {
            Ok(ip) => {
                self.state = LinkState::Connected;
                self.addressing = Some(addressing);
                self.mac = Some(mac);
                self.interval.reset(self.clock.now_ms());
                info!("Ethernet link up, IP {}", ip);
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Error;
                self.stats.begin_failures += 1;
                warn!("Ethernet link failed: {}", e);
                Err(e)
            }
        }
    }

    fn acquire(&mut self, mac: MacAddress, addressing: &Addressing) -> BusResult<Ipv4Addr> {
        self.reset()?;
        self.driver
            .init()
            .map_err(|e| BusError::link_acquisition(format!("Ethernet controller init failed: {}", e)))?;

        let acquired = match addressing {
            Addressing::Dhcp => self.driver.begin_dhcp(mac),
            Addressing::Static(settings) => self.driver.begin_static(mac, settings),
        };
        acquired.map_err(|e| match e {
            BusError::LinkAcquisition { .. } => e,
            other => BusError::link_acquisition(other.to_string()),
        })?;

        let ip = self.driver.local_ip();
        if ip.is_unspecified() {
            return Err(BusError::link_acquisition("No address assigned"));
        }
        Ok(ip)
    }

    /// Periodic maintenance, gated by the check interval
    ///
    /// Returns the new state when this pass changed it.
    pub fn task(&mut self) -> Option<LinkState> {
        let now = self.clock.now_ms();
        if !self.interval.ready(now) {
            return None;
        }

        // Never begun, or begun and failed: nothing to maintain
        let addressing = self.addressing?;
        if matches!(self.state, LinkState::Error | LinkState::Connecting) {
            return None;
        }

        if addressing.is_dhcp() {
            self.maintain_lease();
        }

        match (self.driver.link_status(), self.state) {
            (LinkStatus::Off, LinkState::Connected) => {
                self.state = LinkState::Disconnected;
                self.stats.link_losses += 1;
                warn!("Ethernet cable disconnected");
                Some(self.state)
            }
            (LinkStatus::On, LinkState::Disconnected) => {
                self.state = LinkState::Connected;
                self.stats.link_recoveries += 1;
                info!("Ethernet link restored, IP {}", self.driver.local_ip());
                Some(self.state)
            }
            _ => None,
        }
    }

    fn maintain_lease(&mut self) {
        match self.driver.maintain() {
            DhcpMaintain::NothingHappened => {}
            DhcpMaintain::RenewSuccess | DhcpMaintain::RebindSuccess => {
                self.stats.dhcp_renewals += 1;
                debug!("DHCP lease renewed, IP {}", self.driver.local_ip());
            }
            outcome @ (DhcpMaintain::RenewFailed | DhcpMaintain::RebindFailed) => {
                self.stats.dhcp_failures += 1;
                warn!("DHCP lease maintenance failed: {:?}", outcome);
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Link state and current address
    pub fn status(&self) -> (LinkState, Ipv4Addr) {
        (self.state, self.driver.local_ip())
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.driver.local_ip()
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.driver.subnet_mask()
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.driver.gateway_ip()
    }

    pub fn dns(&self) -> Ipv4Addr {
        self.driver.dns_server_ip()
    }

    /// Address configured by the last successful `begin()`
    pub fn mac_address(&self) -> Option<MacAddress> {
        self.mac
    }

    pub fn addressing(&self) -> Option<Addressing> {
        self.addressing
    }

    pub fn timings(&self) -> LinkTimings {
        self.timings
    }

    pub fn get_stats(&self) -> LinkStats {
        self.stats.clone()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
