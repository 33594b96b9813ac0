//! spec.md expresses every delay and period in abstract "time units"
//! (`MAX_DELAY = 3`, `HEARTBEAT_PERIOD` in `{4, 7.5, 15, 15}`, ...). `Clock`
//! fixes a wall-clock scale for those units so tests can run in
//! milliseconds while production deployments can run in seconds.

use std::time::Duration;

/// Scales abstract time units into `Duration`s. The default of 100ms per
/// unit keeps a full `tests/gmfd.rs` run (tens of heartbeat periods) fast
/// under `tokio::time::pause`/`advance` while staying far enough above zero
/// that relative orderings (`MAX_DELAY < WAITING_FIRST_ACK < WAITING_SECOND_ACK`)
/// can't degenerate from rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clock {
    unit: Duration,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            unit: Duration::from_millis(100),
        }
    }
}

impl Clock {
    pub fn with_unit(unit: Duration) -> Self {
        Self { unit }
    }

    pub fn duration(&self, time_units: f64) -> Duration {
        Duration::from_secs_f64((time_units.max(0.0)) * self.unit.as_secs_f64())
    }

    /// Logical time elapsed since `epoch`, in time units (spec.md's `time()`
    /// — monotonically nondecreasing as long as the wall clock is).
    pub fn since(&self, epoch: tokio::time::Instant) -> f64 {
        epoch.elapsed().as_secs_f64() / self.unit.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_scales_linearly() {
        let clock = Clock::with_unit(Duration::from_millis(10));
        assert_eq!(clock.duration(3.0), Duration::from_millis(30));
        assert_eq!(clock.duration(0.0), Duration::from_millis(0));
    }

    #[test]
    fn negative_time_units_clamp_to_zero() {
        let clock = Clock::default();
        assert_eq!(clock.duration(-5.0), Duration::ZERO);
    }
}
