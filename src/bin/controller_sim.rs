//! Simulated Cortex Link board
//!
//! Runs the full controller against in-memory hardware: the RS485 line is
//! shared with a simulated remote slave, the Ethernet controller is scripted
//! and the sensors random-walk. Useful to watch the super-loop, the master
//! poll cache and link supervision without a board on the desk.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use cortex_link::board::BoardIo;
use cortex_link::config::ControllerConfig;
use cortex_link::hal::LinkStatus;
use cortex_link::host::build_controller;
use cortex_link::logging::init_tracing;
use cortex_link::sim::{SimSerialLine, SimSlave};
use cortex_link::transport::Rs485Transport;
use cortex_link::utils::format;
use cortex_link::{PollTarget, RegisterKind};

/// Slave ID of the simulated remote device
const REMOTE_SLAVE_ID: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "controller_sim")]
#[command(about = "Runs the Cortex Link controller on simulated hardware")]
#[command(version)]
struct Args {
    /// YAML or JSON configuration; board defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Pull the Ethernet cable every N seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    flap_link_secs: u64,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ControllerConfig::default(),
    };
    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level).map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    if config.polls.is_empty() {
        config.polls.push(PollTarget {
            slave_id: REMOTE_SLAVE_ID,
            kind: RegisterKind::HoldingRegister,
            start: 0,
            count: 4,
            period_ms: config.scheduler.poll_interval_ms,
        });
    }

    // Remote device sharing the RS485 segment
    let (line, remote_line) = SimSerialLine::pair();
    let mut remote = SimSlave::new(remote_line, REMOTE_SLAVE_ID);
    remote
        .register_map()
        .insert_range(RegisterKind::HoldingRegister, 0, 16, None)?;
    for address in 0..16 {
        remote
            .register_map()
            .set_value(RegisterKind::HoldingRegister, address, 1000 + address)?;
    }

    let board = BoardIo::new(config.registers.clone());
    let transport = Rs485Transport::with_packet_logging(line, config.modbus.packet_logging);
    let mut controller = build_controller(&config, transport, &board)?;

    let mac = config.ethernet.mac_address()?;
    match controller.begin(mac, config.ethernet.addressing, &config.ethernet.begin_retry) {
        Ok(()) => info!("Ethernet up: {:?}", controller.link().status()),
        Err(e) => warn!("Ethernet unavailable, continuing on RS485 only: {}", e),
    }

    let started = Instant::now();
    let mut ticker = interval(Duration::from_millis(config.scheduler.loop_period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report_ticker = interval(Duration::from_secs(5));
    let mut cable_in = true;
    let mut last_flap = Instant::now();

    info!(
        "Simulated controller running as slave {} for {}s",
        config.modbus.slave_id, args.duration_secs
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                remote.poll()?;
                let pass = controller.poll();
                if let Some(done) = pass.completion {
                    if let Err(e) = &done.result {
                        warn!("Poll of slave {} failed: {}", done.slave_id(), e);
                    }
                }
                if let Some(state) = pass.link_change {
                    info!("Link is now {:?}", state);
                }
            }
            _ = report_ticker.tick() => {
                report(&controller, &board, &config);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        if args.flap_link_secs > 0 && last_flap.elapsed() >= Duration::from_secs(args.flap_link_secs) {
            cable_in = !cable_in;
            last_flap = Instant::now();
            let status = if cable_in { LinkStatus::On } else { LinkStatus::Off };
            controller.link_mut().driver_mut().set_link_status(status);
            info!("Cable {}", if cable_in { "plugged in" } else { "pulled" });
        }

        if started.elapsed() >= Duration::from_secs(args.duration_secs) {
            break;
        }
    }

    report(&controller, &board, &config);
    Ok(())
}

fn report<T, D, W, C>(
    controller: &cortex_link::Controller<T, D, W, C>,
    board: &BoardIo,
    config: &ControllerConfig,
) where
    T: cortex_link::BusTransport,
    D: cortex_link::hal::EthernetDriver,
    W: cortex_link::hal::Delay,
    C: cortex_link::hal::Clock,
{
    let channel = controller.channel();
    let stats = channel.get_stats();
    info!(
        "Bus: {} sent, {} answered, {} timeouts, {} corrupt; server handled {}",
        stats.requests_sent,
        stats.responses_received,
        stats.timeouts,
        stats.corrupt_frames,
        channel.server_stats().requests_handled
    );
    info!("Master: {}", format::format_metrics(channel.metrics()));

    for poll in &config.polls {
        let values: Vec<String> = (poll.start..poll.start + poll.count)
            .map(|address| match channel.cached(poll.slave_id, poll.kind, address) {
                Some(cached) if cached.stale => format!("{}?", cached.value),
                Some(cached) => cached.value.to_string(),
                None => "-".to_string(),
            })
            .collect();
        info!("Slave {} {} {}: [{}]", poll.slave_id, poll.kind, poll.start, values.join(", "));
    }

    if let Ok(state) = board.snapshot() {
        info!(
            "Board: temp {:?} hum {:?} relays {:?} dac {:?}",
            state.temperature, state.humidity, state.relays, state.dac
        );
    }

    let (link_state, ip) = controller.link().status();
    info!("Link: {:?} {}", link_state, ip);
}
