//! Cooperative timing for the control loop
//!
//! Every component that does periodic work owns a [`PollInterval`] and asks it
//! whether the work is due on each loop pass. Work that is not due is skipped,
//! never queued. When a pass finds the period elapsed, the next slot is aligned
//! to the period grid rather than to "now", so jitter in the loop does not
//! accumulate as drift. A pass that is late by several periods runs the work
//! once, not once per missed period.

use tracing::warn;

use crate::error::BusResult;

/// Rate limiter: at most one run per period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval {
    period_ms: u64,
    last_run_ms: u64,
}

impl PollInterval {
    /// Start counting the first period at `now_ms`
    pub fn new(period_ms: u64, now_ms: u64) -> Self {
        Self {
            period_ms: period_ms.max(1),
            last_run_ms: now_ms,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn last_run_ms(&self) -> u64 {
        self.last_run_ms
    }

    /// Returns true and books the run if a full period has elapsed
    ///
    /// The boundary counts: a pass exactly one period after the last run is due.
    pub fn ready(&mut self, now_ms: u64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_run_ms);
        if elapsed < self.period_ms {
            return false;
        }
        self.last_run_ms = now_ms - elapsed % self.period_ms;
        true
    }

    /// Milliseconds until the next run is due
    pub fn due_in(&self, now_ms: u64) -> u64 {
        (self.last_run_ms + self.period_ms).saturating_sub(now_ms)
    }

    /// Restart the period from `now_ms`
    pub fn reset(&mut self, now_ms: u64) {
        self.last_run_ms = now_ms;
    }
}

/// Subsystem driven by the scheduler at its own cadence
///
/// Sensor sampling, relay refresh and similar collaborators implement this and
/// are registered with the controller.
pub trait PeriodicTask {
    fn name(&self) -> &str;

    fn period_ms(&self) -> u64;

    /// Do one unit of work; must return promptly
    fn run(&mut self, now_ms: u64) -> BusResult<()>;
}

struct Scheduled {
    interval: PollInterval,
    task: Box<dyn PeriodicTask + Send>,
    runs: u64,
    failures: u64,
}

/// Run count for one scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub name: String,
    pub runs: u64,
    pub failures: u64,
}

/// Ordered set of periodic tasks sharing one thread
#[derive(Default)]
pub struct PollScheduler {
    tasks: Vec<Scheduled>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; its first run is one period after `now_ms`
    pub fn add(&mut self, task: Box<dyn PeriodicTask + Send>, now_ms: u64) {
        let interval = PollInterval::new(task.period_ms(), now_ms);
        self.tasks.push(Scheduled {
            interval,
            task,
            runs: 0,
            failures: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every due task in registration order; returns how many ran
    ///
    /// A failing task is logged and keeps its schedule.
    pub fn tick(&mut self, now_ms: u64) -> usize {
        let mut ran = 0;
        for scheduled in self.tasks.iter_mut() {
            if !scheduled.interval.ready(now_ms) {
                continue;
            }
            ran += 1;
            scheduled.runs += 1;
            if let Err(e) = scheduled.task.run(now_ms) {
                scheduled.failures += 1;
                warn!("Periodic task '{}' failed: {}", scheduled.task.name(), e);
            }
        }
        ran
    }

    pub fn get_stats(&self) -> Vec<TaskStats> {
        self.tasks
            .iter()
            .map(|s| TaskStats {
                name: s.task.name().to_string(),
                runs: s.runs,
                failures: s.failures,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;

    #[test]
    fn test_independent_cadences() {
        let mut fast = PollInterval::new(1000, 0);
        let mut slow = PollInterval::new(2000, 0);
        let (mut fast_runs, mut slow_runs) = (0, 0);

        for now in (10..=2000).step_by(10) {
            if fast.ready(now) {
                fast_runs += 1;
            }
            if slow.ready(now) {
                slow_runs += 1;
            }
        }

        assert_eq!(fast_runs, 2);
        assert_eq!(slow_runs, 1);
    }

    #[test]
    fn test_no_drift_with_jitter() {
        let mut interval = PollInterval::new(100, 0);
        assert!(interval.ready(107));
        assert_eq!(interval.last_run_ms(), 100);
        assert!(!interval.ready(199));
        assert!(interval.ready(200));
    }

    #[test]
    fn test_missed_periods_are_skipped_not_queued() {
        let mut interval = PollInterval::new(100, 0);
        assert!(interval.ready(550));
        assert!(!interval.ready(560));
        assert_eq!(interval.due_in(560), 40);
    }

    struct Flaky {
        calls: u32,
    }

    impl PeriodicTask for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn period_ms(&self) -> u64 {
            50
        }

        fn run(&mut self, _now_ms: u64) -> BusResult<()> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(BusError::timeout("sensor read", 50));
            }
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_keeps_running_after_failure() {
        let mut scheduler = PollScheduler::new();
        scheduler.add(Box::new(Flaky { calls: 0 }), 0);

        let ran: usize = (1..=200).map(|now| scheduler.tick(now)).sum();
        assert_eq!(ran, 4);

        let stats = scheduler.get_stats();
        assert_eq!(stats[0].runs, 4);
        assert_eq!(stats[0].failures, 2);
    }
}
