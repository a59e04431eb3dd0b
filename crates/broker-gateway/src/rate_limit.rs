use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Priority class for a rate-limited request. Emergency tokens are reserved
/// for cancellations and liquidations so a saturated scan can never starve
/// the protective path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Emergency,
}

/// Sliding one-minute window limiter sized below the broker's published
/// per-minute cap.
///
/// `usable` is `rate_limit_per_minute * rate_limit_utilization`; `reserve`
/// tokens on top of that are only reachable at `Priority::Emergency`.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<VecDeque<Instant>>,
    usable: usize,
    reserve: usize,
}

const WINDOW: Duration = Duration::from_secs(60);

impl RateLimiter {
    pub fn new(per_minute: usize, utilization: f64, reserve: usize) -> Self {
        let usable = ((per_minute as f64) * utilization).floor() as usize;
        Self {
            window: Mutex::new(VecDeque::with_capacity(usable + reserve)),
            usable: usable.max(1),
            reserve,
        }
    }

    /// Block until a token is available for the given priority, then record
    /// the request timestamp. Acquisition is strictly serialized on the
    /// window lock.
    pub async fn acquire(&self, priority: Priority) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                match Self::try_admit(&mut window, now, self.capacity_for(priority)) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tracing::debug!(
                wait_ms = wait.as_millis() as u64,
                "rate limit window full, sleeping until rollover"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Requests currently counted inside the window.
    pub async fn in_flight_last_minute(&self) -> usize {
        let mut window = self.window.lock().await;
        Self::prune(&mut window, Instant::now());
        window.len()
    }

    fn capacity_for(&self, priority: Priority) -> usize {
        match priority {
            Priority::Normal => self.usable,
            Priority::Emergency => self.usable + self.reserve,
        }
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit a request at `now` if the window holds fewer than `cap`
    /// entries, otherwise return how long until the oldest entry rolls out.
    fn try_admit(
        window: &mut VecDeque<Instant>,
        now: Instant,
        cap: usize,
    ) -> Result<(), Duration> {
        Self::prune(window, now);
        if window.len() < cap {
            window.push_back(now);
            return Ok(());
        }
        let oldest = *window.front().expect("non-empty window at cap");
        let elapsed = now.duration_since(oldest);
        Err(WINDOW.saturating_sub(elapsed) + Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_window(n: usize, now: Instant, age: Duration) -> VecDeque<Instant> {
        (0..n).map(|_| now - age).collect()
    }

    #[test]
    fn admits_below_cap() {
        let now = Instant::now();
        let mut window = filled_window(5, now, Duration::from_secs(10));
        assert!(RateLimiter::try_admit(&mut window, now, 160).is_ok());
        assert_eq!(window.len(), 6);
    }

    #[test]
    fn saturated_window_reports_rollover_wait() {
        let now = Instant::now();
        // 160 requests made 55 seconds ago: the next call must wait ~5s.
        let mut window = filled_window(160, now, Duration::from_secs(55));
        let wait = RateLimiter::try_admit(&mut window, now, 160).unwrap_err();
        assert!(wait >= Duration::from_secs(4), "wait was {:?}", wait);
        assert!(wait <= Duration::from_secs(6), "wait was {:?}", wait);
    }

    #[test]
    fn emergency_reserve_admits_past_normal_cap() {
        let now = Instant::now();
        let limiter = RateLimiter::new(200, 0.8, 10);
        let mut window = filled_window(160, now, Duration::from_secs(5));

        // Normal priority is refused, emergency still has headroom.
        assert!(RateLimiter::try_admit(
            &mut window,
            now,
            limiter.capacity_for(Priority::Normal)
        )
        .is_err());
        assert!(RateLimiter::try_admit(
            &mut window,
            now,
            limiter.capacity_for(Priority::Emergency)
        )
        .is_ok());
    }

    #[test]
    fn old_entries_roll_out() {
        let now = Instant::now();
        let mut window = filled_window(160, now, Duration::from_secs(61));
        assert!(RateLimiter::try_admit(&mut window, now, 160).is_ok());
        // Only the freshly admitted entry remains.
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn utilization_sizes_the_budget() {
        let limiter = RateLimiter::new(200, 0.8, 10);
        assert_eq!(limiter.capacity_for(Priority::Normal), 160);
        assert_eq!(limiter.capacity_for(Priority::Emergency), 170);
    }
}
