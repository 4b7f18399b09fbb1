//! Sliding-window admission control for classification calls.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Admits at most `capacity` calls in any rolling `window`.
///
/// Denied callers are expected to leave their work staged and come back on a
/// later pass. Shared across workers behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// `per_minute` admissions per rolling 60 seconds.
    pub fn per_minute(per_minute: usize) -> Self {
        Self::new(per_minute, Duration::from_secs(60))
    }

    /// Try to take a slot now.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut admitted = self.lock();
        self.evict(&mut admitted, now);
        if admitted.len() >= self.capacity {
            return false;
        }
        admitted.push_back(now);
        true
    }

    /// Time until the oldest admission leaves the window (zero if a slot is free).
    pub fn retry_after(&self) -> Duration {
        let now = Instant::now();
        let mut admitted = self.lock();
        self.evict(&mut admitted, now);
        if admitted.len() < self.capacity {
            return Duration::ZERO;
        }
        admitted
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Admissions currently inside the window.
    pub fn current_count(&self) -> usize {
        let now = Instant::now();
        let mut admitted = self.lock();
        self.evict(&mut admitted, now);
        admitted.len()
    }

    fn evict(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // The deque stays consistent even if a holder panicked.
        self.admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn thirty_first_call_in_window_is_deferred() {
        let limiter = RateLimiter::per_minute(30);
        for _ in 0..30 {
            assert!(limiter.admit());
        }
        assert!(!limiter.admit());
        assert_eq!(limiter.current_count(), 30);
        assert_eq!(limiter.retry_after(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_call_admitted_once_window_rolls() {
        let limiter = RateLimiter::per_minute(30);
        for _ in 0..30 {
            assert!(limiter.admit());
        }
        assert!(!limiter.admit());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.admit());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_sliding_not_fixed() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.admit());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.admit());
        assert!(!limiter.admit());

        // First admission expires; the second is still inside the window.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.admit());
        assert!(!limiter.admit());
        assert_eq!(limiter.retry_after(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_capacity() {
        let limiter = Arc::new(RateLimiter::per_minute(30));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.admit() }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 30);
    }

    #[tokio::test]
    async fn retry_after_zero_when_free() {
        let limiter = RateLimiter::per_minute(5);
        assert_eq!(limiter.retry_after(), Duration::ZERO);
    }
}
