//! Sliding-window admission control in front of the answer pipeline.
//!
//! The limiter keeps the timestamps of accepted requests inside the trailing
//! window. A timestamp leaves the window once its age reaches the window
//! length, so sleeping for exactly [`RateLimiter::wait_time`] is always
//! enough to be admitted.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RateLimitConfig;

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    accepted: Mutex<VecDeque<Duration>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window,
            clock,
            accepted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.max_requests,
            Duration::from_secs_f64(config.window_secs),
            clock,
        )
    }

    /// Record the request and return `true` if the window has room.
    pub fn allow_request(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Time until a request would be admitted; zero when it would be now.
    pub fn wait_time(&self) -> Duration {
        let now = self.clock.now();
        let mut accepted = self.accepted.lock();
        self.prune(&mut accepted, now);
        self.wait_locked(&accepted, now)
    }

    /// Admit or reject in one critical section.
    ///
    /// On rejection the returned duration is the wait until the oldest
    /// accepted request ages out.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut accepted = self.accepted.lock();
        self.prune(&mut accepted, now);

        if accepted.len() < self.max_requests {
            accepted.push_back(now);
            return Ok(());
        }

        let wait = self.wait_locked(&accepted, now);
        tracing::debug!(
            in_window = accepted.len(),
            wait_ms = wait.as_millis() as u64,
            "rate limit rejected request"
        );
        Err(wait)
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(&self, accepted: &mut VecDeque<Duration>, now: Duration) {
        while let Some(&oldest) = accepted.front() {
            if now.saturating_sub(oldest) >= self.window {
                accepted.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_locked(&self, accepted: &VecDeque<Duration>, now: Duration) -> Duration {
        if accepted.len() < self.max_requests {
            return Duration::ZERO;
        }
        match accepted.front() {
            Some(&oldest) => self.window.saturating_sub(now.saturating_sub(oldest)),
            None => self.window,
        }
    }
}
