/// Bounded retries for operations that may fail transiently
///
/// Used where the firmware used to loop a fixed number of times around a
/// flaky peripheral (sensor reads, link bring-up). The backoff is a blocking
/// delay, so a policy belongs only in start-up paths or in periodic tasks
/// whose period already absorbs `max_attempts × backoff_ms`.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BusError, BusResult};
use crate::hal::Delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self::new(1, 0)
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.max_attempts == 0 {
            return Err(BusError::configuration("Retry policy needs at least one attempt"));
        }
        Ok(())
    }

    /// Worst-case time spent in backoff
    pub fn max_backoff_ms(&self) -> u64 {
        self.backoff_ms * self.max_attempts.saturating_sub(1) as u64
    }

    /// Run `op` until it succeeds, fails unrecoverably, or attempts run out
    ///
    /// The closure receives the 1-based attempt number. The last error is
    /// returned when every attempt fails.
    pub fn run<T, D, F>(&self, delay: &mut D, mut op: F) -> BusResult<T>
    where
        D: Delay + ?Sized,
        F: FnMut(u32) -> BusResult<T>,
    {
        self.validate()?;

        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && e.is_recoverable() => {
                    debug!("Attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    delay.delay_ms(self.backoff_ms);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingDelay;

    #[test]
    fn test_retries_until_success() {
        let policy = RetryPolicy::new(3, 100);
        let mut delay = RecordingDelay::new();

        let result = policy.run(&mut delay, |attempt| {
            if attempt < 3 {
                Err(BusError::timeout("DS18B20 conversion", 750))
            } else {
                Ok(21.5)
            }
        });

        assert_eq!(result.unwrap(), 21.5);
        assert_eq!(delay.calls(), vec![100, 100]);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, 10);
        let mut delay = RecordingDelay::new();
        let mut calls = 0;

        let result: BusResult<()> = policy.run(&mut delay, |_| {
            calls += 1;
            Err(BusError::link_acquisition("DHCP timeout"))
        });

        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert_eq!(delay.total_ms(), 10);
    }

    #[test]
    fn test_unrecoverable_error_not_retried() {
        let policy = RetryPolicy::new(5, 10);
        let mut delay = RecordingDelay::new();
        let mut calls = 0;

        let result: BusResult<()> = policy.run(&mut delay, |_| {
            calls += 1;
            Err(BusError::hardware_not_ready("no reset line"))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(delay.calls().is_empty());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RetryPolicy::new(0, 10).validate().is_err());
        assert_eq!(RetryPolicy::default().max_backoff_ms(), 200);
    }
}
