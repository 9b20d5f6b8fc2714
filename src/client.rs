/// Modbus RTU master role
///
/// The master never blocks waiting for a slave. A request is submitted, the
/// encoded frame goes out on the bus, and the transaction then sits in
/// `AwaitingResponse` until the channel pump hands it a matching frame or the
/// wall-clock deadline passes:
///
/// ```text
///            submit()              matching frame
///   Idle ───────────────▶ AwaitingResponse ─────────────▶ Complete
///    ▲                         │    ▲                        │
///    │                         │    │ foreign / corrupt      │
///    │                         │    └── frame (discarded)    │
///    │                deadline │                             │
///    │                         ▼                             │
///    └──────────────────── TimedOut ◀────────────────────────┘
///                     (take_completion)
/// ```
///
/// At most one transaction is in flight; a second submit while awaiting fails
/// with `TransactionInFlight`.
use tracing::debug;

use crate::error::{BusError, BusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, BROADCAST_SLAVE_ID};
use crate::register_map::RegisterKind;
use crate::rtu;

/// Decoded payload of a successful transaction
#[derive(Debug, Clone, PartialEq)]
pub enum MasterReply {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    /// Echo of a write: start address and value (single) or quantity (multiple)
    WriteAck { address: u16, value: u16 },
    /// Broadcast writes are never answered
    Broadcast,
}

impl MasterReply {
    /// Values as the register cache stores them (bits as 0/1)
    pub fn cache_values(&self) -> Option<Vec<u16>> {
        match self {
            MasterReply::Registers(values) => Some(values.clone()),
            MasterReply::Bits(bits) => Some(bits.iter().map(|&b| u16::from(b)).collect()),
            _ => None,
        }
    }
}

/// Finished transaction handed back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request: ModbusRequest,
    pub result: BusResult<MasterReply>,
    pub elapsed_ms: u64,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn slave_id(&self) -> SlaveId {
        self.request.slave_id
    }

    /// Table the request addressed
    pub fn kind(&self) -> RegisterKind {
        self.request.function.register_kind()
    }
}

/// Master transaction state
#[derive(Debug, Clone, PartialEq)]
pub enum MasterState {
    Idle,
    AwaitingResponse {
        request: ModbusRequest,
        sent_at_ms: u64,
        deadline_ms: u64,
    },
    Complete(Completion),
    TimedOut(Completion),
}

/// Outcome of offering a received frame to the master
#[derive(Debug, Clone, PartialEq)]
pub enum FrameVerdict {
    /// No transaction was waiting for a frame
    Unsolicited,
    /// The frame could not belong to the outstanding request
    Discarded(BusError),
    /// The frame completed the outstanding transaction
    Completed,
}

/// Non-blocking RTU master
#[derive(Debug, Clone)]
pub struct RtuMaster {
    state: MasterState,
    response_timeout_ms: u64,
}

impl RtuMaster {
    pub fn new(response_timeout_ms: u64) -> Self {
        Self {
            state: MasterState::Idle,
            response_timeout_ms,
        }
    }

    pub fn state(&self) -> &MasterState {
        &self.state
    }

    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms
    }

    /// No transaction is waiting on the bus
    pub fn is_idle(&self) -> bool {
        !self.is_awaiting()
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, MasterState::AwaitingResponse { .. })
    }

    /// Request currently on the wire
    pub fn pending(&self) -> Option<&ModbusRequest> {
        match &self.state {
            MasterState::AwaitingResponse { request, .. } => Some(request),
            _ => None,
        }
    }

    /// Validate and encode a request, moving to `AwaitingResponse`
    ///
    /// The caller must put the returned frame on the bus and report a send
    /// failure through [`RtuMaster::fail`]. Broadcast writes complete as soon
    /// as they are submitted.
    pub fn submit(&mut self, request: ModbusRequest, now_ms: u64) -> BusResult<Vec<u8>> {
        if let Some(pending) = self.pending() {
            return Err(BusError::transaction_in_flight(pending.slave_id));
        }
        let frame = rtu::encode_request(&request)?;

        if request.slave_id == BROADCAST_SLAVE_ID {
            self.state = MasterState::Complete(Completion {
                request,
                result: Ok(MasterReply::Broadcast),
                elapsed_ms: 0,
            });
        } else {
            self.state = MasterState::AwaitingResponse {
                request,
                sent_at_ms: now_ms,
                deadline_ms: now_ms.saturating_add(self.response_timeout_ms),
            };
        }
        Ok(frame)
    }

    /// Abort the outstanding transaction with an error (send failure)
    pub fn fail(&mut self, error: BusError, now_ms: u64) {
        let state = std::mem::replace(&mut self.state, MasterState::Idle);
        self.state = match state {
            MasterState::AwaitingResponse { request, sent_at_ms, .. } => MasterState::Complete(Completion {
                request,
                result: Err(error),
                elapsed_ms: now_ms.saturating_sub(sent_at_ms),
            }),
            MasterState::Complete(Completion { request, .. }) => MasterState::Complete(Completion {
                request,
                result: Err(error),
                elapsed_ms: 0,
            }),
            other => other,
        };
    }

    /// Offer one complete response frame to the outstanding transaction
    pub fn on_frame(&mut self, frame: &[u8], now_ms: u64) -> FrameVerdict {
        let (request, sent_at_ms) = match &self.state {
            MasterState::AwaitingResponse { request, sent_at_ms, .. } => (request, *sent_at_ms),
            _ => return FrameVerdict::Unsolicited,
        };

        let response = match rtu::decode_response(frame) {
            Ok(response) => response,
            Err(e) => return FrameVerdict::Discarded(e),
        };
        if response.slave_id != request.slave_id {
            return FrameVerdict::Discarded(BusError::corruption(format!(
                "Response slave ID mismatch: expected {}, got {}",
                request.slave_id, response.slave_id
            )));
        }
        if response.function != request.function {
            return FrameVerdict::Discarded(BusError::corruption(format!(
                "Response function mismatch: expected {}, got {}",
                request.function, response.function
            )));
        }

        let result = match Self::interpret(request, &response) {
            // Right slave and function but unusable payload: keep waiting
            Err(e @ BusError::Frame { .. }) => return FrameVerdict::Discarded(e),
            other => other,
        };

        let elapsed_ms = now_ms.saturating_sub(sent_at_ms);
        debug!(
            "Transaction {} slave:{} finished in {}ms",
            request.function, request.slave_id, elapsed_ms
        );
        let state = std::mem::replace(&mut self.state, MasterState::Idle);
        if let MasterState::AwaitingResponse { request, .. } = state {
            self.state = MasterState::Complete(Completion {
                request,
                result,
                elapsed_ms,
            });
        }
        FrameVerdict::Completed
    }

    /// Move to `TimedOut` if the deadline has passed; returns true on transition
    pub fn check_timeout(&mut self, now_ms: u64) -> bool {
        let expired = matches!(
            &self.state,
            MasterState::AwaitingResponse { deadline_ms, .. } if now_ms >= *deadline_ms
        );
        if !expired {
            return false;
        }

        let state = std::mem::replace(&mut self.state, MasterState::Idle);
        if let MasterState::AwaitingResponse { request, sent_at_ms, .. } = state {
            let error = BusError::timeout(
                format!("{} slave:{} @ {}", request.function, request.slave_id, request.address),
                self.response_timeout_ms,
            );
            self.state = MasterState::TimedOut(Completion {
                request,
                result: Err(error),
                elapsed_ms: now_ms.saturating_sub(sent_at_ms),
            });
        }
        true
    }

    /// Take a finished transaction, returning the master to `Idle`
    pub fn take_completion(&mut self) -> Option<Completion> {
        match std::mem::replace(&mut self.state, MasterState::Idle) {
            MasterState::Complete(completion) | MasterState::TimedOut(completion) => Some(completion),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn interpret(request: &ModbusRequest, response: &ModbusResponse) -> BusResult<MasterReply> {
        if let Some(err) = response.get_exception() {
            return Err(err);
        }

        match request.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let mut bits = response.parse_bits()?;
                if bits.len() < request.quantity as usize {
                    return Err(BusError::frame("Bit response shorter than requested"));
                }
                bits.truncate(request.quantity as usize);
                Ok(MasterReply::Bits(bits))
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let registers = response.parse_registers()?;
                if registers.len() != request.quantity as usize {
                    return Err(BusError::frame(format!(
                        "Expected {} registers, got {}",
                        request.quantity,
                        registers.len()
                    )));
                }
                Ok(MasterReply::Registers(registers))
            }
            ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleCoils
            | ModbusFunction::WriteMultipleRegisters => {
                let (address, value) = response.parse_write_echo()?;
                if address != request.address {
                    return Err(BusError::frame(format!(
                        "Write echo address {} does not match request {}",
                        address, request.address
                    )));
                }
                Ok(MasterReply::WriteAck { address, value })
            }
        }
    }
}
