//! Per-lane admission control.
//!
//! Each lane admits at most `limit` job executions per rolling window
//! (one second by default), matching the provider's throughput ceiling.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rolling-window counter. Pure; callers supply the clock.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            admitted: VecDeque::with_capacity(limit),
        }
    }

    /// Admit one execution at `now`, or return how long to wait before the
    /// oldest admission leaves the window.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(oldest) = self.admitted.front() {
            if *oldest + self.window <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() < self.limit {
            self.admitted.push_back(now);
            return Ok(());
        }

        match self.admitted.front() {
            Some(oldest) => Err((*oldest + self.window).saturating_duration_since(now)),
            None => Ok(()),
        }
    }

    /// Admissions currently inside the window ending at `now`.
    pub fn in_window(&self, now: Instant) -> usize {
        self.admitted
            .iter()
            .filter(|at| **at + self.window > now)
            .count()
    }
}

/// Async limiter shared by a lane's workers.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    pub fn per_second(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            window: Mutex::new(SlidingWindow::new(limit, window)),
        }
    }

    /// Wait until an execution slot is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                match window.try_admit(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn admits_up_to_limit_then_reports_wait() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(2, Duration::from_secs(1));

        assert!(window.try_admit(start).is_ok());
        assert!(window.try_admit(start + Duration::from_millis(100)).is_ok());

        let wait = window
            .try_admit(start + Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(wait, Duration::from_millis(800));

        // The first admission has left the window.
        assert!(window.try_admit(start + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(0, Duration::from_secs(1));
        assert!(window.try_admit(start).is_ok());
        assert!(window.try_admit(start).is_err());
    }

    #[tokio::test]
    async fn limiter_admits_burst_without_waiting() {
        let limiter = RateLimiter::per_second(5);
        let started = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    proptest! {
        #[test]
        fn never_more_than_limit_in_any_window(
            limit in 1usize..8,
            gaps in prop::collection::vec(0u64..400, 1..60),
        ) {
            let start = Instant::now();
            let window_len = Duration::from_secs(1);
            let mut window = SlidingWindow::new(limit, window_len);
            let mut now = start;
            let mut admitted: Vec<Instant> = Vec::new();

            for gap in gaps {
                now += Duration::from_millis(gap);
                if window.try_admit(now).is_ok() {
                    admitted.push(now);
                }
                let recent = admitted.iter().filter(|at| **at + window_len > now).count();
                prop_assert!(recent <= limit);
                prop_assert_eq!(window.in_window(now), recent);
            }
        }
    }
}
