//! Periodic timing for the real-time loops

use std::time::{Duration, Instant};

/// Deadlines further behind than this are abandoned rather than caught up
const MAX_CATCH_UP: Duration = Duration::from_millis(100);

/// Drift-corrected fixed-period timer
///
/// Each deadline is the previous deadline plus one period, not the time the
/// work finished plus one period, so jitter does not accumulate. After a
/// stall longer than [`MAX_CATCH_UP`] (system sleep, debugger) the schedule
/// restarts from now instead of firing a burst of late ticks.
#[derive(Debug)]
pub struct PeriodicTimer {
    period: Duration,
    next: Instant,
    ticks: u64,
    late: u64,
    resyncs: u64,
}

impl PeriodicTimer {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now())
    }

    pub fn starting_at(period: Duration, start: Instant) -> Self {
        let period = period.max(Duration::from_micros(1));
        PeriodicTimer {
            period,
            next: start + period,
            ticks: 0,
            late: 0,
            resyncs: 0,
        }
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Deadline of the next tick
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Consume the pending deadline and return how long to sleep for it
    pub fn advance(&mut self, now: Instant) -> Duration {
        let wake = self.next;
        self.ticks += 1;

        if now > wake {
            self.late += 1;
            if now - wake > MAX_CATCH_UP {
                self.resyncs += 1;
                self.next = now + self.period;
                return Duration::ZERO;
            }
        }

        self.next = wake + self.period;
        wake.saturating_duration_since(now)
    }

    /// Block the calling thread until the next deadline
    pub fn wait(&mut self) {
        let sleep = self.advance(Instant::now());
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks whose deadline had already passed
    pub fn late_ticks(&self) -> u64 {
        self.late
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(2);

    #[test]
    fn test_on_time() {
        let t0 = Instant::now();
        let mut timer = PeriodicTimer::starting_at(PERIOD, t0);

        // Work took 0.5 ms; sleep the rest of the period
        let sleep = timer.advance(t0 + Duration::from_micros(500));
        assert_eq!(sleep, Duration::from_micros(1500));
        assert_eq!(timer.deadline(), t0 + 2 * PERIOD);
    }

    #[test]
    fn test_deadlines_do_not_drift() {
        let t0 = Instant::now();
        let mut timer = PeriodicTimer::starting_at(PERIOD, t0);

        // Wake slightly late every time
        for i in 1..=100u32 {
            let now = t0 + PERIOD * i + Duration::from_micros(300);
            timer.advance(now);
        }
        assert_eq!(timer.deadline(), t0 + PERIOD * 101);
        assert_eq!(timer.late_ticks(), 100);
    }

    #[test]
    fn test_small_overrun_catches_up() {
        let t0 = Instant::now();
        let mut timer = PeriodicTimer::starting_at(PERIOD, t0);

        // 5 ms late: no sleep, schedule kept
        assert_eq!(timer.advance(t0 + Duration::from_millis(7)), Duration::ZERO);
        assert_eq!(timer.deadline(), t0 + 2 * PERIOD);
        assert_eq!(timer.resyncs(), 0);
    }

    #[test]
    fn test_stall_resyncs() {
        let t0 = Instant::now();
        let mut timer = PeriodicTimer::starting_at(PERIOD, t0);

        let now = t0 + Duration::from_secs(1);
        assert_eq!(timer.advance(now), Duration::ZERO);
        assert_eq!(timer.deadline(), now + PERIOD);
        assert_eq!(timer.resyncs(), 1);
    }

    #[test]
    fn test_wait_sleeps() {
        let mut timer = PeriodicTimer::new(Duration::from_millis(5));
        let start = Instant::now();
        timer.wait();
        timer.wait();
        assert!(start.elapsed() >= Duration::from_millis(9));
        assert_eq!(timer.ticks(), 2);
    }
}
