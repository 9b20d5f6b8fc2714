/// Utility functions and helpers
///
/// Transaction metrics for the master role, argument validation shared by the
/// configuration layer and the binaries, and display formatting.
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::{BusError, BusResult};

/// Timing metrics for master transactions, in clock milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful operation
    pub fn record_success(&mut self, elapsed_ms: u64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_ms += elapsed_ms;

        self.min_ms = Some(self.min_ms.map_or(elapsed_ms, |min| min.min(elapsed_ms)));
        self.max_ms = Some(self.max_ms.map_or(elapsed_ms, |max| max.max(elapsed_ms)));
    }

    /// Record a failed operation
    pub fn record_failure(&mut self, elapsed_ms: u64) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.total_ms += elapsed_ms;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    pub fn avg_ms(&self) -> u64 {
        if self.total_requests == 0 {
            return 0;
        }
        self.total_ms / self.total_requests
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> BusResult<()> {
        if slave_id == 0 || slave_id > crate::protocol::MAX_SLAVE_ID {
            return Err(BusError::invalid_data(format!(
                "Invalid slave ID: {} (must be 1-247)",
                slave_id
            )));
        }
        Ok(())
    }

    /// Validate address range
    pub fn validate_address_range(start: u16, count: u16) -> BusResult<()> {
        if count == 0 || (start as u32 + count as u32) > 65536 {
            return Err(BusError::invalid_address(start, count));
        }
        Ok(())
    }

    /// Validate a MAC address for use on the wire
    ///
    /// Multicast and all-zero addresses are rejected.
    pub fn validate_mac(mac: &[u8; 6]) -> BusResult<()> {
        if mac.iter().all(|&b| b == 0) || mac[0] & 0x01 != 0 {
            return Err(BusError::configuration(format!(
                "Invalid unicast MAC address: {}",
                format::mac_to_string(mac)
            )));
        }
        Ok(())
    }

    /// Validate an interface address
    pub fn validate_host_ip(ip: Ipv4Addr) -> BusResult<()> {
        if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
            return Err(BusError::configuration(format!("Invalid host address: {}", ip)));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    pub fn mac_to_string(mac: &[u8; 6]) -> String {
        mac.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Format milliseconds in a human-readable way
    pub fn format_millis(millis: u64) -> String {
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", millis as f64 / 1000.0)
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format transaction metrics as a table
    pub fn format_metrics(metrics: &TransactionMetrics) -> String {
        format!(
            "Transaction Metrics:\n\
             ├─ Total Requests: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average: {}\n\
             ├─ Min: {}\n\
             └─ Max: {}",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.success_rate(),
            metrics.failed_requests,
            format_millis(metrics.avg_ms()),
            metrics.min_ms.map_or("N/A".to_string(), format_millis),
            metrics.max_ms.map_or("N/A".to_string(), format_millis),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_metrics() {
        let mut metrics = TransactionMetrics::new();

        metrics.record_success(100);
        metrics.record_success(200);
        metrics.record_failure(1000);

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.min_ms, Some(100));
        assert_eq!(metrics.max_ms, Some(200));
        assert_eq!(metrics.avg_ms(), 433);
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);
    }

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_id(1).is_ok());
        assert!(validation::validate_slave_id(247).is_ok());
        assert!(validation::validate_slave_id(0).is_err());
        assert!(validation::validate_slave_id(248).is_err());

        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 5).is_ok());
        assert!(validation::validate_address_range(65530, 10).is_err());

        assert!(validation::validate_mac(&[0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED]).is_ok());
        assert!(validation::validate_mac(&[0; 6]).is_err());
        assert!(validation::validate_mac(&[0x01, 0, 0x5E, 0, 0, 1]).is_err());

        assert!(validation::validate_host_ip(Ipv4Addr::new(192, 168, 1, 50)).is_ok());
        assert!(validation::validate_host_ip(Ipv4Addr::UNSPECIFIED).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::format_millis(1500), "1.50s");
        assert_eq!(format::mac_to_string(&[0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED]), "DE:AD:BE:EF:FE:ED");
    }
}
