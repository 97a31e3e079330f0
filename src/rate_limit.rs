//! Sliding-window admission control.
//!
//! [`SlidingWindow`] remembers the instant of every admission within the last window and
//! admits a new one only while fewer than `capacity` remain. It gates outbound provider calls
//! in the request queue and inbound webhook deliveries per connection.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use uuid::Uuid;

/// Admission log over a trailing window.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            admitted: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit at `now`, or report how long until a slot frees up.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.evict(now);
        if self.admitted.len() < self.capacity {
            self.admitted.push_back(now);
            return Ok(());
        }
        let oldest = self.admitted.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Wait until a slot is free, then take it. Returns the time spent waiting.
    pub async fn acquire(&mut self) -> Duration {
        let started = Instant::now();
        loop {
            match self.try_acquire(Instant::now()) {
                Ok(()) => return started.elapsed(),
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Fill the window so nothing is admitted for `pause`. Used when the provider itself signals
    /// that its bucket is nearly exhausted.
    pub fn pause_for(&mut self, pause: Duration) {
        let now = Instant::now();
        let resume_marker = now + pause;
        let backdated = resume_marker.checked_sub(self.window).unwrap_or(now);
        self.admitted.clear();
        for _ in 0..self.capacity {
            self.admitted.push_back(backdated);
        }
    }
}

/// Per-connection webhook limiter: `limit` deliveries per minute per connection.
pub struct WebhookRateLimiter {
    limit: usize,
    window: Duration,
    windows: Mutex<LruCache<Uuid, SlidingWindow>>,
}

const TRACKED_CONNECTIONS: usize = 10_000;

impl WebhookRateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit as usize, Duration::from_secs(60))
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        let tracked = NonZeroUsize::new(TRACKED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            limit,
            window,
            windows: Mutex::new(LruCache::new(tracked)),
        }
    }

    /// Count a delivery for `connection_id`. `Err` carries the suggested retry delay.
    pub fn check(&self, connection_id: Uuid) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.get_or_insert_mut(connection_id, || {
            SlidingWindow::new(self.limit, self.window)
        });
        window.try_acquire(now)
    }

    /// Forget a connection's window (on disconnect).
    pub fn forget(&self, connection_id: Uuid) {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        windows.pop(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_capacity_then_reports_wait() {
        let mut window = SlidingWindow::new(3, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(window.try_acquire(now).is_ok());
        }
        assert_eq!(window.try_acquire(now), Err(Duration::from_secs(1)));

        let later = now + Duration::from_millis(400);
        assert_eq!(window.try_acquire(later), Err(Duration::from_millis(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_rather_than_resetting() {
        let mut window = SlidingWindow::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        window.try_acquire(t0).unwrap();
        window.try_acquire(t0 + Duration::from_millis(600)).unwrap();

        // First admission has aged out, second has not.
        assert!(window.try_acquire(t0 + Duration::from_millis(1000)).is_ok());
        assert!(window.try_acquire(t0 + Duration::from_millis(1100)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_free_slot() {
        let mut window = SlidingWindow::new(1, Duration::from_secs(1));
        assert_eq!(window.acquire().await, Duration::ZERO);
        let waited = window.acquire().await;
        assert_eq!(waited, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_admission_for_the_pause() {
        let mut window = SlidingWindow::new(5, Duration::from_secs(1));
        window.pause_for(Duration::from_millis(300));
        let waited = window.acquire().await;
        assert_eq!(waited, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_limiter_is_per_connection() {
        let limiter = WebhookRateLimiter::new(2, Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_err());
        assert!(limiter.check(b).is_ok());

        limiter.forget(a);
        assert!(limiter.check(a).is_ok());
    }
}
