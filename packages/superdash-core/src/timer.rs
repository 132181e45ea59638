//! Drift-free periodic scheduling.
//!
//! Every periodic loop in the system (vMix poll, WebSocket broadcast, TSL
//! refresh) derives its deadlines from an immutable start reference instead
//! of `last_fire + period`. The average interval is then exactly the period
//! regardless of tick-handler jitter or duration.

use std::time::Duration;

use tokio::time::Instant;

/// Periodic timer whose deadlines are multiples of the period measured from
/// a fixed origin.
///
/// The next deadline after elapsed time `e` is `ceil(e / T) * T`: the first
/// tick at the origin fires immediately, and a tick handler that runs long
/// simply lands on a later multiple rather than shifting the whole
/// schedule.
#[derive(Debug)]
pub struct DriftFreeTimer {
    origin: Instant,
    period: Duration,
    /// Set after the first tick; the zero deadline at the origin is only
    /// valid once.
    fired: bool,
}

impl DriftFreeTimer {
    /// Creates a timer with its origin at the current instant.
    ///
    /// A zero period is clamped to 1 ms so the timer cannot busy-loop.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self::with_origin(Instant::now(), period)
    }

    /// Creates a timer with an explicit origin (used by tests).
    #[must_use]
    pub fn with_origin(origin: Instant, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            origin,
            period,
            fired: false,
        }
    }

    /// Duration until the next period multiple, measured from `now`.
    ///
    /// `ceil(elapsed / period) * period - elapsed`: zero at the origin
    /// itself, a full period beyond a positive exact multiple, the
    /// remainder otherwise.
    #[must_use]
    pub fn delay_until_next(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.origin);
        let period_ns = self.period.as_nanos();
        let elapsed_ns = elapsed.as_nanos();
        if elapsed_ns == 0 {
            // Already on the grid; the first tick fires immediately.
            return Duration::ZERO;
        }
        // A positive exact multiple already fired; advance a full period so
        // no deadline is served twice.
        let intervals = elapsed_ns / period_ns + 1;
        let target_ns = intervals * period_ns;
        Duration::from_nanos((target_ns - elapsed_ns) as u64)
    }

    /// Sleeps until the next period multiple.
    pub async fn tick(&mut self) {
        let mut delay = self.delay_until_next(Instant::now());
        if self.fired && delay.is_zero() {
            // A handler fast enough to return at the exact deadline instant
            // must not fire twice on the same multiple.
            delay = self.period;
        }
        tokio::time::sleep(delay).await;
        self.fired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_fires_immediately() {
        let origin = Instant::now();
        let timer = DriftFreeTimer::with_origin(origin, Duration::from_millis(500));
        assert_eq!(timer.delay_until_next(origin), Duration::ZERO);
    }

    #[test]
    fn delay_fills_the_remainder_of_the_period() {
        let origin = Instant::now();
        let timer = DriftFreeTimer::with_origin(origin, Duration::from_millis(500));
        let delay = timer.delay_until_next(origin + Duration::from_millis(120));
        assert_eq!(delay, Duration::from_millis(380));
    }

    #[test]
    fn positive_exact_multiple_advances_a_full_period() {
        let origin = Instant::now();
        let timer = DriftFreeTimer::with_origin(origin, Duration::from_millis(500));
        let delay = timer.delay_until_next(origin + Duration::from_millis(1000));
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[test]
    fn overrun_skips_to_the_next_multiple() {
        let origin = Instant::now();
        let timer = DriftFreeTimer::with_origin(origin, Duration::from_millis(200));
        // A handler that ran 430 ms past the origin lands on the 600 ms slot.
        let delay = timer.delay_until_next(origin + Duration::from_millis(430));
        assert_eq!(delay, Duration::from_millis(170));
    }

    #[test]
    fn zero_period_is_clamped() {
        let timer = DriftFreeTimer::new(Duration::ZERO);
        assert!(timer.delay_until_next(Instant::now()) <= Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate_then_ticks_stay_on_the_grid() {
        let mut timer = DriftFreeTimer::new(Duration::from_millis(100));
        let start = Instant::now();

        timer.tick().await;
        assert!(start.elapsed().is_zero(), "first tick should not wait");

        for i in 1..=4u32 {
            timer.tick().await;
            assert_eq!(start.elapsed().as_millis() as u32, i * 100);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_lands_on_a_later_multiple() {
        let mut timer = DriftFreeTimer::new(Duration::from_millis(100));
        let start = Instant::now();

        timer.tick().await;
        // Handler overruns one full slot.
        tokio::time::advance(Duration::from_millis(130)).await;
        timer.tick().await;
        assert_eq!(start.elapsed().as_millis(), 200);
    }
}
