//! Local I/O exposed through the server register map
//!
//! The board's inputs, relays, sensors and DAC are owned by their own drivers.
//! [`BoardIo`] is the snapshot those drivers publish into and the relay/DAC
//! commands they pick up; [`BoardIo::expose`] maps it onto the register layout
//! and [`BoardSampler`] copies fresh readings into the map on a fixed cadence.
//!
//! | Table            | Contents                           |
//! |------------------|------------------------------------|
//! | discrete inputs  | digital inputs                     |
//! | coils            | relay outputs                      |
//! | input registers  | analog, DHT temperature/humidity, DS18B20 |
//! | holding registers| DAC outputs (0..=4095)             |

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::channel::ModbusChannel;
use crate::config::RegisterLayout;
use crate::error::{BusError, BusResult};
use crate::hal::Clock;
use crate::register_map::{RegisterKind, RegisterMap};
use crate::scheduler::PeriodicTask;
use crate::transport::BusTransport;

/// Largest value the 12-bit DAC accepts
pub const DAC_MAX: u16 = 4095;

/// Latest readings and output commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardState {
    pub inputs: Vec<bool>,
    pub relays: Vec<bool>,
    pub analog: Vec<u16>,
    /// Tenths of a degree Celsius, two's complement
    pub temperature: Vec<u16>,
    /// Tenths of a percent
    pub humidity: Vec<u16>,
    pub ds18b20: Vec<u16>,
    pub dac: Vec<u16>,
}

impl BoardState {
    pub fn for_layout(layout: &RegisterLayout) -> Self {
        Self {
            inputs: vec![false; layout.input_count as usize],
            relays: vec![false; layout.relay_count as usize],
            analog: vec![0; layout.analog_count as usize],
            temperature: vec![0; layout.dht_count as usize],
            humidity: vec![0; layout.dht_count as usize],
            ds18b20: vec![0; layout.ds18b20_count as usize],
            dac: vec![0; layout.dac_count as usize],
        }
    }
}

/// Shared handle to the board state
#[derive(Debug, Clone)]
pub struct BoardIo {
    state: Arc<Mutex<BoardState>>,
    layout: RegisterLayout,
}

impl BoardIo {
    pub fn new(layout: RegisterLayout) -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState::for_layout(&layout))),
            layout,
        }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    pub fn lock(&self) -> BusResult<MutexGuard<'_, BoardState>> {
        self.state
            .lock()
            .map_err(|_| BusError::internal("Failed to lock board state"))
    }

    pub fn snapshot(&self) -> BusResult<BoardState> {
        Ok(self.lock()?.clone())
    }

    /// Register every group of the layout on the channel
    ///
    /// Relays and DAC outputs get write handlers that record the command;
    /// the read-only tables are refreshed by [`BoardSampler`].
    pub fn expose<T: BusTransport, C: Clock>(&self, channel: &mut ModbusChannel<T, C>) -> BusResult<()> {
        let layout = &self.layout;
        if layout.input_count > 0 {
            channel.register_range(RegisterKind::DiscreteInput, layout.inputs_start, layout.input_count, None)?;
        }
        if layout.relay_count > 0 {
            let state = Arc::clone(&self.state);
            let start = layout.relays_start;
            channel.register_coil_range(start, layout.relay_count, move |address, value| {
                if let Ok(mut state) = state.lock() {
                    if let Some(relay) = state.relays.get_mut((address - start) as usize) {
                        *relay = value != 0;
                    }
                }
                value
            })?;
        }
        for (start, count) in [
            (layout.analog_start, layout.analog_count),
            (layout.temperature_start, layout.dht_count),
            (layout.humidity_start, layout.dht_count),
            (layout.ds18b20_start, layout.ds18b20_count),
        ] {
            if count > 0 {
                channel.register_range(RegisterKind::InputRegister, start, count, None)?;
            }
        }
        if layout.dac_count > 0 {
            let state = Arc::clone(&self.state);
            let start = layout.dac_start;
            channel.register_holding_range(start, layout.dac_count, move |address, value| {
                let value = value.min(DAC_MAX);
                if let Ok(mut state) = state.lock() {
                    if let Some(dac) = state.dac.get_mut((address - start) as usize) {
                        *dac = value;
                    }
                }
                value
            })?;
        }
        debug!("Board I/O exposed on {} registers", channel.register_map().len());
        Ok(())
    }
}

/// Copies board readings into the register map
pub struct BoardSampler {
    board: BoardIo,
    map: RegisterMap,
    period_ms: u64,
}

impl BoardSampler {
    pub fn new(board: BoardIo, map: RegisterMap, period_ms: u64) -> Self {
        Self { board, map, period_ms }
    }

    fn publish(&self, kind: RegisterKind, start: u16, values: impl IntoIterator<Item = u16>) -> BusResult<()> {
        for (i, value) in values.into_iter().enumerate() {
            self.map.set_value(kind, start + i as u16, value)?;
        }
        Ok(())
    }
}

impl PeriodicTask for BoardSampler {
    fn name(&self) -> &str {
        "board-sampler"
    }

    fn period_ms(&self) -> u64 {
        self.period_ms
    }

    fn run(&mut self, _now_ms: u64) -> BusResult<()> {
        let state = self.board.snapshot()?;
        let layout = self.board.layout().clone();

        self.publish(
            RegisterKind::DiscreteInput,
            layout.inputs_start,
            state.inputs.iter().map(|&b| u16::from(b)),
        )?;
        self.publish(RegisterKind::InputRegister, layout.analog_start, state.analog)?;
        self.publish(RegisterKind::InputRegister, layout.temperature_start, state.temperature)?;
        self.publish(RegisterKind::InputRegister, layout.humidity_start, state.humidity)?;
        self.publish(RegisterKind::InputRegister, layout.ds18b20_start, state.ds18b20)?;
        Ok(())
    }
}
