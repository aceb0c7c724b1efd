use std::fmt::Debug;
use std::time::Instant;

/// Source of monotonic time that the pool uses to decay caller-supplied timeouts.
///
/// Rust has no standard clock abstraction, so this trait exists to let the pool run against a
/// controlled clock where the real one is not suitable.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Debug + Send + Sync + 'static {
    /// The current point in time. Successive calls must never go backwards.
    fn now(&self) -> Instant;
}

/// The default [`Clock`], backed by [`Instant::now()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[cfg_attr(test, mutants::skip)] // Real time cannot be asserted on, only observed.
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(MonotonicClock: Clock, Copy);

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock;

        let first = clock.now();
        let second = clock.now();

        assert!(second >= first);
    }
}
