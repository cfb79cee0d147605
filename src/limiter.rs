//! Upstream rate limiter - per-config RPM pacing
//!
//! One logical limiter exists per `(family, config name)` pair; each family
//! service owns its own `RateLimiter` instance keyed by config name.
//!
//! `rpm_limit = N` admits at most `floor(N * 0.9)` requests in any trailing
//! 60-second window. The 10% margin keeps us under provider quotas even
//! with clock skew between us and the upstream.
//!
//! Admission is FIFO per key: waiters queue on a per-key async mutex and
//! sleep while holding it until the oldest admission leaves the window.
//! Dropping a waiting future releases the gate, so cancellation wakes the
//! next waiter. Callers must not hold other locks across `acquire`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Window {
    admissions: VecDeque<Instant>,
}

#[derive(Default)]
pub struct RateLimiter {
    states: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Window>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective window capacity for a configured RPM.
    fn capacity(rpm: u32) -> usize {
        ((rpm as usize) * 9 / 10).max(1)
    }

    /// Wait until the next request is permitted for `key`.
    ///
    /// Returns how long the caller waited. `rpm_limit` of `None` or 0 means
    /// no limiting. The capacity is re-read on every admission, so edits to
    /// a config's `rpm_limit` take effect on the next request.
    pub async fn acquire(&self, key: &str, rpm_limit: Option<u32>) -> Duration {
        let Some(rpm) = rpm_limit.filter(|&rpm| rpm > 0) else {
            return Duration::ZERO;
        };
        let cap = Self::capacity(rpm);

        let state = {
            let mut states = self.states.lock().unwrap();
            states.entry(key.to_string()).or_default().clone()
        };

        let started = Instant::now();
        // Holding the gate across the sleep is what makes admission FIFO:
        // the tokio mutex queues waiters fairly, and dropping a sleeping
        // waiter releases the gate to the next one.
        let mut window = state.lock().await;
        loop {
            let now = Instant::now();
            while window
                .admissions
                .front()
                .is_some_and(|&t| now.duration_since(t) >= WINDOW)
            {
                window.admissions.pop_front();
            }

            if window.admissions.len() < cap {
                window.admissions.push_back(now);
                return started.elapsed();
            }

            // Window full: the earliest admission decides when a slot opens
            let wake = window.admissions[0] + WINDOW;
            sleep_until(wake).await;
        }
    }

    /// Discard limiter state for configs that no longer exist. A renamed
    /// config starts over with an empty window.
    pub fn retain(&self, live: &HashSet<String>) {
        let mut states = self.states.lock().unwrap();
        states.retain(|key, _| live.contains(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_ninety_percent_of_rpm_per_window() {
        let limiter = RateLimiter::new();
        let mut admitted = Vec::new();
        for _ in 0..20 {
            limiter.acquire("c1", Some(10)).await;
            admitted.push(Instant::now());
        }

        // No trailing 60s window holds more than floor(10 * 0.9) = 9
        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[..=i]
                .iter()
                .filter(|&&earlier| t.duration_since(earlier) < WINDOW)
                .count();
            assert!(in_window <= 9, "window held {} admissions", in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_capacity_requests_do_not_wait() {
        let limiter = RateLimiter::new();
        for _ in 0..9 {
            let waited = limiter.acquire("c1", Some(10)).await;
            assert_eq!(waited, Duration::ZERO);
        }
        let waited = limiter.acquire("c1", Some(10)).await;
        assert!(waited >= Duration::from_secs(59));
    }

    #[tokio::test]
    async fn unlimited_when_rpm_absent_or_zero() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.acquire("c1", None).await, Duration::ZERO);
        assert_eq!(limiter.acquire("c1", Some(0)).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new();
        limiter.acquire("c1", Some(1)).await;
        // A different config is not throttled by c1's window
        let waited = limiter.acquire("c2", Some(1)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_releases_the_gate() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.acquire("c1", Some(1)).await;

        // This waiter blocks (window is full), then is dropped
        let mut blocked = Box::pin(limiter.acquire("c1", Some(1)));
        assert!(futures::poll!(blocked.as_mut()).is_pending());
        drop(blocked);

        // The next waiter still gets through once the window expires
        let waited = limiter.acquire("c1", Some(1)).await;
        assert!(waited >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn retain_drops_stale_state() {
        let limiter = RateLimiter::new();
        limiter.acquire("old", Some(1)).await;

        limiter.retain(&HashSet::from(["new".to_string()]));

        // "old" was forgotten: a fresh window admits immediately
        let waited = limiter.acquire("old", Some(1)).await;
        assert_eq!(waited, Duration::ZERO);
    }
}
