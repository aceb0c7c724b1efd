use std::time::{Duration, Instant};

use crate::Clock;

/// A caller-supplied time budget, fixed to a point in time when the operation starts.
///
/// Every pool operation that accepts a timeout creates one of these first and then consults it
/// before each blocking step (acquiring the lock, waiting for a chunk to become free), so that the
/// steps together never exceed the original budget.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    timeout: Duration,

    // `None` if the budget is so large that the clock cannot represent its end.
    expires_at: Option<Instant>,
}

/// How much of a [`Deadline`] is left at a given moment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Remaining {
    /// The budget never runs out.
    Unbounded,

    /// This much time is left.
    Left(Duration),

    /// The budget is used up.
    Elapsed,
}

impl Deadline {
    pub(crate) fn start<C: Clock + ?Sized>(clock: &C, timeout: Duration) -> Self {
        Self {
            timeout,
            expires_at: clock.now().checked_add(timeout),
        }
    }

    /// The budget the caller originally supplied, for error reporting.
    #[must_use]
    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub(crate) fn remaining<C: Clock + ?Sized>(&self, clock: &C) -> Remaining {
        let Some(expires_at) = self.expires_at else {
            return Remaining::Unbounded;
        };

        match expires_at.checked_duration_since(clock.now()) {
            Some(left) if !left.is_zero() => Remaining::Left(left),
            _ => Remaining::Elapsed,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::MockClock;

    /// A clock that reports `start` on the first call and `start + step * n` on the n-th call after.
    fn stepping_clock(start: Instant, step: Duration) -> MockClock {
        let mut clock = MockClock::new();
        let mut calls: u32 = 0;

        clock.expect_now().returning(move || {
            let now = start + step * calls;
            calls += 1;
            now
        });

        clock
    }

    #[test]
    fn budget_decays_with_time() {
        let clock = stepping_clock(Instant::now(), Duration::from_millis(10));

        let deadline = Deadline::start(&clock, Duration::from_millis(25));

        assert_eq!(
            deadline.remaining(&clock),
            Remaining::Left(Duration::from_millis(15))
        );
        assert_eq!(
            deadline.remaining(&clock),
            Remaining::Left(Duration::from_millis(5))
        );
        assert_eq!(deadline.remaining(&clock), Remaining::Elapsed);
        assert_eq!(deadline.remaining(&clock), Remaining::Elapsed);
    }

    #[test]
    fn exactly_reaching_the_end_is_elapsed() {
        let clock = stepping_clock(Instant::now(), Duration::from_millis(10));

        let deadline = Deadline::start(&clock, Duration::from_millis(10));

        assert_eq!(deadline.remaining(&clock), Remaining::Elapsed);
    }

    #[test]
    fn zero_budget_is_elapsed_immediately() {
        let clock = stepping_clock(Instant::now(), Duration::ZERO);

        let deadline = Deadline::start(&clock, Duration::ZERO);

        assert_eq!(deadline.remaining(&clock), Remaining::Elapsed);
        assert_eq!(deadline.timeout(), Duration::ZERO);
    }

    #[test]
    fn unrepresentable_budget_is_unbounded() {
        let clock = stepping_clock(Instant::now(), Duration::from_secs(3600));

        let deadline = Deadline::start(&clock, Duration::MAX);

        assert_eq!(deadline.remaining(&clock), Remaining::Unbounded);
        assert_eq!(deadline.remaining(&clock), Remaining::Unbounded);
        assert_eq!(deadline.timeout(), Duration::MAX);
    }
}
