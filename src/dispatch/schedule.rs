use std::time::Duration;

/// Shortest periodic interval; finer values are rounded up
pub const MIN_PERIOD: Duration = Duration::from_millis(1);
/// Longest periodic interval; larger or infinite values are rounded down
pub const MAX_PERIOD: Duration = Duration::from_secs(u32::MAX as u64);

/// When the worker flushes without being asked
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchSchedule {
    /// Only on an explicit `dispatch()`
    Manual,
    /// After every queued hit
    Immediate,
    /// Every period while hits are pending
    Periodic(Duration),
}

impl DispatchSchedule {
    /// Maps the signed interval in seconds onto a schedule
    pub fn from_secs(interval_secs: f64) -> Self {
        if interval_secs.is_nan() || interval_secs < 0.0 {
            DispatchSchedule::Manual
        } else if interval_secs == 0.0 {
            DispatchSchedule::Immediate
        } else {
            let period = Duration::try_from_secs_f64(interval_secs).unwrap_or(MAX_PERIOD);
            DispatchSchedule::Periodic(period.clamp(MIN_PERIOD, MAX_PERIOD))
        }
    }

    pub fn as_secs(&self) -> f64 {
        match self {
            DispatchSchedule::Manual => -1.0,
            DispatchSchedule::Immediate => 0.0,
            DispatchSchedule::Periodic(period) => period.as_secs_f64(),
        }
    }

    /// Whether failed flushes are retried on a timer
    pub fn retries_automatically(&self) -> bool {
        !matches!(self, DispatchSchedule::Manual)
    }
}

impl Default for DispatchSchedule {
    fn default() -> Self {
        DispatchSchedule::Periodic(Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_regimes() {
        assert_eq!(DispatchSchedule::from_secs(-1.0), DispatchSchedule::Manual);
        assert_eq!(DispatchSchedule::from_secs(0.0), DispatchSchedule::Immediate);
        assert_eq!(
            DispatchSchedule::from_secs(2.5),
            DispatchSchedule::Periodic(Duration::from_millis(2500))
        );
        assert_eq!(DispatchSchedule::from_secs(f64::NAN), DispatchSchedule::Manual);
    }

    #[test]
    fn test_out_of_range_intervals_are_clamped() {
        assert_eq!(DispatchSchedule::from_secs(1e-12), DispatchSchedule::Periodic(MIN_PERIOD));
        assert_eq!(
            DispatchSchedule::from_secs(f64::INFINITY),
            DispatchSchedule::Periodic(MAX_PERIOD)
        );
        assert_eq!(DispatchSchedule::from_secs(1e15), DispatchSchedule::Periodic(MAX_PERIOD));
        assert_eq!(DispatchSchedule::from_secs(1e30), DispatchSchedule::Periodic(MAX_PERIOD));
        assert_eq!(DispatchSchedule::from_secs(f64::NEG_INFINITY), DispatchSchedule::Manual);
    }

    #[test]
    fn test_round_trip_seconds() {
        assert_eq!(DispatchSchedule::from_secs(120.0).as_secs(), 120.0);
        assert!(DispatchSchedule::Manual.as_secs() < 0.0);
        assert!(!DispatchSchedule::Manual.retries_automatically());
        assert!(DispatchSchedule::Immediate.retries_automatically());
    }
}
