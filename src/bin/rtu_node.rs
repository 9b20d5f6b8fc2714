//! Cortex Link RTU node on a host serial port
//!
//! Runs the Modbus channel on a real RS485 adapter: answers external masters
//! from the simulated board registers and polls the slaves listed in the
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use cortex_link::board::BoardIo;
use cortex_link::config::ControllerConfig;
use cortex_link::host::{build_controller, HostSerialLine};
use cortex_link::logging::init_tracing;
use cortex_link::transport::{BusTransport, Rs485Transport};
use cortex_link::utils::format;

#[derive(Parser, Debug)]
#[command(name = "rtu_node")]
#[command(about = "Modbus RTU master/server node for a USB-RS485 adapter")]
#[command(version)]
struct Args {
    /// YAML or JSON configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate, overrides the configuration
    #[arg(short, long)]
    baud: Option<u32>,

    /// Slave ID answered as a server, overrides the configuration
    #[arg(short, long)]
    slave_id: Option<u8>,

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
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
        config.modbus.baud_rate = baud;
    }
    if let Some(slave_id) = args.slave_id {
        config.modbus.slave_id = slave_id;
    }
    config.validate().context("Invalid configuration")?;

    let level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level).map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;
    info!("{}", cortex_link::info());

    let line = HostSerialLine::open(&config.serial)
        .with_context(|| format!("Failed to open {}", config.serial.port))?;
    let transport = Rs485Transport::with_packet_logging(line, config.modbus.packet_logging);

    let board = BoardIo::new(config.registers.clone());
    let mut controller = build_controller(&config, transport, &board)?;

    let mac = config.ethernet.mac_address()?;
    if let Err(e) = controller.begin(mac, config.ethernet.addressing, &config.ethernet.begin_retry) {
        error!("Ethernet bring-up failed: {}", e);
    }

    info!(
        "Serving slave {} on {} at {} baud, polling {} block(s)",
        config.modbus.slave_id,
        config.serial.port,
        config.serial.baud_rate,
        config.polls.len()
    );

    let mut ticker = interval(Duration::from_millis(config.scheduler.loop_period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_ticker = interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pass = controller.poll();
                if let Some(done) = pass.completion {
                    match &done.result {
                        Ok(reply) => debug!("Slave {} answered: {:?}", done.slave_id(), reply),
                        Err(e) => error!("Slave {} failed: {}", done.slave_id(), e),
                    }
                }
            }
            _ = stats_ticker.tick() => {
                let channel = controller.channel();
                info!("{:?}", channel.get_stats());
                info!("Master: {}", format::format_metrics(channel.metrics()));
                info!("Transport: {:?}", channel.transport().get_stats());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}
