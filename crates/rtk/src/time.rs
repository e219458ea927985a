//! Time base types.

/// Count of time-base interrupts since the kernel was built.
///
/// 64 bits wide, so wrap-around is not handled.
pub type Tick = u64;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately if the call cannot complete.
    NoWait,
    Ticks(Tick),
    Forever,
}

impl Timeout {
    pub const fn ticks(ticks: Tick) -> Self {
        if ticks == 0 {
            Timeout::NoWait
        } else {
            Timeout::Ticks(ticks)
        }
    }

    pub const fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }

    /// Absolute tick at which a wait starting at `now` expires.
    pub fn deadline(self, now: Tick) -> Option<Tick> {
        match self {
            Timeout::NoWait => Some(now),
            Timeout::Ticks(ticks) => Some(now.saturating_add(ticks)),
            Timeout::Forever => None,
        }
    }
}

/// Converts milliseconds to ticks at `tick_rate_hz`, rounding down.
pub const fn ms_to_ticks(ms: u64, tick_rate_hz: u32) -> Tick {
    ms.saturating_mul(tick_rate_hz as u64) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ticks_means_no_wait() {
        assert_eq!(Timeout::ticks(0), Timeout::NoWait);
        assert!(Timeout::Ticks(0).is_no_wait());
        assert!(!Timeout::Forever.is_no_wait());
    }

    #[test]
    fn deadlines_are_absolute() {
        assert_eq!(Timeout::Ticks(5).deadline(10), Some(15));
        assert_eq!(Timeout::NoWait.deadline(10), Some(10));
        assert_eq!(Timeout::Forever.deadline(10), None);
        assert_eq!(Timeout::Ticks(5).deadline(Tick::MAX), Some(Tick::MAX));
    }

    #[test]
    fn converts_milliseconds() {
        assert_eq!(ms_to_ticks(500, 1000), 500);
        assert_eq!(ms_to_ticks(500, 100), 50);
        assert_eq!(ms_to_ticks(5, 100), 0);
        assert_eq!(ms_to_ticks(u64::MAX, 1000), u64::MAX / 1000);
    }
}
