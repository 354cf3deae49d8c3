//! Clock capability used by the timer queue.
//!
//! Deadlines are absolute timepoints of whichever clock the queue was built
//! with. The dispatcher samples `now` and computes bounded waits through the
//! same clock, so deadlines and waits can never disagree on a time base.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

pub trait Clock: Send + Sync + 'static {
    type Instant: Copy + Ord + Send + Sync + fmt::Debug + 'static;

    fn now(&self) -> Self::Instant;

    /// Time remaining until `deadline`, saturating to zero for past deadlines.
    fn until(&self, deadline: Self::Instant) -> Duration;
}

/// Default clock backed by [`std::time::Instant`]. Immune to wall-clock jumps.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    type Instant = Instant;

    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn until(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }
}

/// Wall clock backed by [`std::time::SystemTime`].
///
/// A backwards clock jump lengthens pending waits and a forward jump fires
/// timers early; deployments that cannot tolerate this should schedule
/// against [`MonotonicClock`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = SystemTime;

    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    #[inline]
    fn until(&self, deadline: SystemTime) -> Duration {
        deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, MonotonicClock, SystemClock};
    use std::time::Duration;

    #[test]
    fn monotonic_until_saturates_for_past_deadlines() {
        let clock = MonotonicClock;
        let past = clock.now() - Duration::from_secs(5);
        assert_eq!(clock.until(past), Duration::ZERO);
        let future = clock.now() + Duration::from_secs(5);
        assert!(clock.until(future) > Duration::from_secs(4));
    }

    #[test]
    fn system_until_saturates_for_past_deadlines() {
        let clock = SystemClock;
        let past = clock.now() - Duration::from_secs(5);
        assert_eq!(clock.until(past), Duration::ZERO);
        let future = clock.now() + Duration::from_secs(5);
        assert!(clock.until(future) > Duration::from_secs(4));
    }
}
