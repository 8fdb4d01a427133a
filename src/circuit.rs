//! Failure-tracking guard around the inference service.
//!
//! ```text
//!   Closed ──N consecutive failures──▶ Open ──open timer elapsed──▶ HalfOpen
//!     ▲                                 ▲                              │
//!     └────────── trial succeeds ───────┼──────────────────────────────┤
//!                                       └──── trial fails (backoff) ───┘
//! ```
//!
//! Callers ask [`CircuitBreaker::check`] for an [`Admission`]. An admitted
//! call holds a [`Permit`] and reports its outcome through it. A permit
//! dropped without an outcome (the caller's future was cancelled) frees the
//! half-open trial slot without counting a failure, so cancellation never
//! wedges the breaker.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Raised instead of calling the protected service while the circuit is open.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("circuit for '{service}' is open, retry after {:.1}s", retry_after.as_secs_f64())]
pub struct CircuitOpenError {
    pub service: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub backoff_multiplier: f64,
    pub max_open: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs_f64(config.recovery_secs),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
            max_open: Duration::from_secs_f64(config.max_open_secs),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Duration>,
    opened_at: Duration,
    open_for: Duration,
    trial_in_flight: bool,
}

/// Outcome of [`CircuitBreaker::check`].
pub enum Admission<'a> {
    Allowed(Permit<'a>),
    Rejected { retry_after: Duration },
}

pub struct CircuitBreaker {
    service: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        let open_for = settings.recovery_timeout;
        Self {
            service: service.into(),
            settings,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: Duration::ZERO,
                open_for,
                trial_in_flight: false,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current mode, with an expired open timer reported as half-open.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if now.saturating_sub(inner.opened_at) >= inner.open_for => {
                CircuitState::HalfOpen
            }
            s => s,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Whether a call may proceed now. In half-open mode this claims the
    /// single trial slot.
    pub fn allow_request(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.admit_locked(&mut inner, now).is_ok()
    }

    /// Admit or reject in one critical section.
    pub fn check(&self) -> Admission<'_> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match self.admit_locked(&mut inner, now) {
            Ok(trial) => Admission::Allowed(Permit {
                breaker: self,
                trial,
                settled: false,
            }),
            Err(retry_after) => Admission::Rejected { retry_after },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.close_locked(&mut inner);
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.failure_locked(&mut inner, now);
    }

    /// Remaining open time; zero unless the circuit is open.
    pub fn retry_after(&self) -> Duration {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner
                .open_for
                .saturating_sub(now.saturating_sub(inner.opened_at)),
            _ => Duration::ZERO,
        }
    }

    /// Run `op` under the breaker.
    ///
    /// While the circuit is open `op` is never invoked and the caller gets a
    /// [`CircuitOpenError`] converted into its own error type.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let permit = match self.check() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected { retry_after } => {
                return Err(CircuitOpenError {
                    service: self.service.clone(),
                    retry_after,
                }
                .into())
            }
        };

        let result = op().await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Returns `Ok(is_trial)` on admission or `Err(retry_after)`.
    fn admit_locked(&self, inner: &mut Inner, now: Duration) -> Result<bool, Duration> {
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.opened_at);
                if elapsed >= inner.open_for {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(service = %self.service, "circuit half-open, admitting trial call");
                    Ok(true)
                } else {
                    Err(inner.open_for - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // trial outcome pending; callers back off for one recovery period
                    Err(self.settings.recovery_timeout)
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn close_locked(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Closed {
            tracing::info!(service = %self.service, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.open_for = self.settings.recovery_timeout;
    }

    fn failure_locked(&self, inner: &mut Inner, now: Duration) {
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                let max_open = self.settings.max_open;
                let open_for = Duration::try_from_secs_f64(
                    inner.open_for.as_secs_f64() * self.settings.backoff_multiplier,
                )
                .map_or(max_open, |backed_off| backed_off.min(max_open));
                self.trip_locked(inner, now, open_for);
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.trip_locked(inner, now, self.settings.recovery_timeout);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip_locked(&self, inner: &mut Inner, now: Duration, open_for: Duration) {
        inner.state = CircuitState::Open;
        inner.opened_at = now;
        inner.open_for = open_for;
        inner.trial_in_flight = false;
        tracing::warn!(
            service = %self.service,
            failures = inner.consecutive_failures,
            open_secs = open_for.as_secs_f64(),
            "circuit opened"
        );
    }

    fn settle(&self, trial: bool, outcome: Option<bool>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match outcome {
            Some(true) => {
                // A late success from a call admitted before the circuit
                // tripped must not close it; only the trial can.
                if trial || inner.state == CircuitState::Closed {
                    self.close_locked(&mut inner);
                }
            }
            Some(false) => {
                if trial || inner.state == CircuitState::Closed {
                    self.failure_locked(&mut inner, now);
                } else {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure = Some(now);
                }
            }
            None => {
                if trial && inner.state == CircuitState::HalfOpen {
                    inner.trial_in_flight = false;
                }
            }
        }
    }
}

/// Admission ticket for one protected call.
#[must_use = "report the outcome with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial, Some(true));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial, Some(false));
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.trial, None);
        }
    }
}
