//! # RS485 bus transport
//!
//! Exclusive wrapper around the half-duplex serial line the Modbus channel
//! talks through. The transport knows nothing about Modbus semantics: it moves
//! whole frames out and raw bytes in, and keeps the transceiver direction line
//! consistent.
//!
//! ## Direction control
//!
//! The RS485 driver is put in transmit mode for exactly the duration of one
//! frame write and returned to receive mode right after the line is flushed.
//! The release also happens when the write fails, so a serial error can never
//! leave the bus jammed in transmit.
//!
//! ## Usage
//!
//! ```rust
//! use cortex_link::sim::SimSerialLine;
//! use cortex_link::transport::{BusTransport, Rs485Transport};
//!
//! let (line, mut peer) = SimSerialLine::pair();
//! let mut transport = Rs485Transport::new(line);
//! transport.send(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]).unwrap();
//!
//! assert_eq!(peer.drain_input().len(), 8);
//! assert_eq!(transport.get_stats().frames_sent, 1);
//! ```

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::BusResult;
use crate::hal::SerialLine;

/// Size of one non-blocking read from the line
const READ_CHUNK_SIZE: usize = 64;

/// Frame-level access to the bus
///
/// Implementations perform no retries; a failed send is reported once and the
/// caller decides what to do with it.
pub trait BusTransport {
    /// Write one complete frame with the transceiver in transmit mode
    fn send(&mut self, frame: &[u8]) -> BusResult<()>;

    /// Append every byte already received to `buf` without blocking
    ///
    /// Returns the number of bytes appended.
    fn receive(&mut self, buf: &mut BytesMut) -> BusResult<usize>;

    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

/// RS485 transport over a [`SerialLine`]
pub struct Rs485Transport<L> {
    line: L,
    stats: TransportStats,
    packet_logging: bool,
}

impl<L: SerialLine> Rs485Transport<L> {
    pub fn new(line: L) -> Self {
        Self {
            line,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Create a transport with packet logging enabled
    pub fn with_packet_logging(line: L, enabled: bool) -> Self {
        Self {
            packet_logging: enabled,
            ..Self::new(line)
        }
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    fn write_frame(&mut self, frame: &[u8]) -> BusResult<()> {
        self.line.write_all(frame)?;
        self.line.flush()
    }
}

impl<L: SerialLine> BusTransport for Rs485Transport<L> {
    fn send(&mut self, frame: &[u8]) -> BusResult<()> {
        if let Err(e) = self.line.set_tx_enable(true) {
            self.stats.errors += 1;
            return Err(e);
        }

        let written = self.write_frame(frame);
        // Always hand the bus back, whatever happened to the write
        let released = self.line.set_tx_enable(false);

        match (written, released) {
            (Ok(()), Ok(())) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                if self.packet_logging {
                    debug!("[MODBUS-RTU] send {}", hex::encode_upper(frame));
                }
                Ok(())
            }
            (Err(e), release) => {
                self.stats.errors += 1;
                if let Err(release_err) = release {
                    warn!("RS485 direction release failed after write error: {}", release_err);
                }
                Err(e)
            }
            (Ok(()), Err(e)) => {
                self.stats.errors += 1;
                Err(e)
            }
        }
    }

    fn receive(&mut self, buf: &mut BytesMut) -> BusResult<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        loop {
            let n = match self.line.read_available(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            total += n;
        }

        if total > 0 {
            self.stats.bytes_received += total as u64;
            if self.packet_logging {
                debug!("[MODBUS-RTU] receive {}", hex::encode_upper(&buf[buf.len() - total..]));
            }
        }
        Ok(total)
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSerialLine;

    #[test]
    fn test_direction_released_after_send() {
        let (line, mut peer) = SimSerialLine::pair();
        let mut transport = Rs485Transport::new(line);

        transport.send(&[0x01, 0x06, 0x00, 0x46, 0x01, 0x00, 0x00, 0x00]).unwrap();

        assert_eq!(transport.line().tx_enable_history(), vec![true, false]);
        assert!(!transport.line().tx_enabled());
        assert_eq!(peer.drain_input().len(), 8);
    }

    #[test]
    fn test_direction_released_when_write_fails() {
        let (mut line, _peer) = SimSerialLine::pair();
        line.fail_next_write();
        let mut transport = Rs485Transport::new(line);

        assert!(transport.send(&[0x01, 0x03]).is_err());
        assert!(!transport.line().tx_enabled());
        assert_eq!(transport.get_stats().errors, 1);
        assert_eq!(transport.get_stats().frames_sent, 0);
    }

    #[test]
    fn test_receive_drains_line() {
        let (line, mut peer) = SimSerialLine::pair();
        let mut transport = Rs485Transport::new(line);
        let payload: Vec<u8> = (0..100).collect();
        peer.write_all(&payload).unwrap();
        assert_eq!(transport.line().pending_input(), 100);
        transport.set_packet_logging(true);

        let mut buf = BytesMut::new();
        assert_eq!(transport.receive(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &payload[..]);
        assert_eq!(transport.receive(&mut buf).unwrap(), 0);
        assert_eq!(transport.get_stats().bytes_received, 100);
    }
}
