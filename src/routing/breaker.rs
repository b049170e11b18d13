//! Per-endpoint circuit breaker
//!
//! Failure accounting with the classic closed/open/half-open machine.
//! Transitions for a single endpoint are linearizable: all state lives behind
//! one mutex and every observation goes through it. Which failures count is
//! decided by the caller via [`crate::error::RouteError::counts_against_breaker`].

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation; calls pass through
    Closed,
    /// All calls fast-fail until the cooldown elapses
    Open,
    /// A bounded number of probe calls are admitted
    HalfOpen,
}

/// Permit returned by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPermit {
    /// Breaker is closed; the call proceeds normally
    Full,
    /// Breaker is half-open; the call is one of the bounded probes
    Probe,
}

/// Tuning for a single breaker
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// Consecutive counted failures that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting probes
    pub open_cooldown: Duration,
    /// Consecutive probe successes that close the breaker again
    pub half_open_successes: u32,
    /// A failure streak resets when the gap between failures exceeds this
    pub window: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(60),
            half_open_successes: 3,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
        last_failure_at: Option<Instant>,
    },
    Open {
        since: Instant,
    },
    HalfOpen {
        successes: u32,
        inflight_probes: u32,
    },
}

/// Failure-aware gate guarding one endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given settings
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Current state, applying the open-to-half-open transition lazily
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.roll_forward(&mut inner);
        match *inner {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Whether the router may place this endpoint in a candidate list
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.state() != BreakerState::Open
    }

    /// Consecutive counted failures while closed; zero otherwise
    #[must_use]
    pub fn failure_streak(&self) -> u32 {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        match *inner {
            Inner::Closed { consecutive_failures, .. } => consecutive_failures,
            _ => 0,
        }
    }

    /// Tries to admit a call
    ///
    /// Returns `None` while open. In half-open state at most
    /// `half_open_successes` probes may be in flight at once.
    #[must_use]
    pub fn try_acquire(&self) -> Option<BreakerPermit> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.roll_forward(&mut inner);
        match *inner {
            Inner::Closed { .. } => Some(BreakerPermit::Full),
            Inner::Open { .. } => None,
            Inner::HalfOpen { successes, ref mut inflight_probes } => {
                let budget = self.settings.half_open_successes.saturating_sub(successes);
                if *inflight_probes < budget {
                    *inflight_probes += 1;
                    Some(BreakerPermit::Probe)
                } else {
                    None
                }
            }
        }
    }

    /// Records a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match *inner {
            Inner::Closed { .. } => {
                *inner = Inner::Closed {
                    consecutive_failures: 0,
                    last_failure_at: None,
                };
            }
            // A success observed while open can only come from a call that
            // was admitted before the trip; it does not close the breaker.
            Inner::Open { .. } => {}
            Inner::HalfOpen { successes, inflight_probes } => {
                let successes = successes + 1;
                if successes >= self.settings.half_open_successes {
                    *inner = Inner::Closed {
                        consecutive_failures: 0,
                        last_failure_at: None,
                    };
                } else {
                    *inner = Inner::HalfOpen {
                        successes,
                        inflight_probes: inflight_probes.saturating_sub(1),
                    };
                }
            }
        }
    }

    /// Records a counted failure
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match *inner {
            Inner::Closed { consecutive_failures, last_failure_at } => {
                // The streak only accumulates within the rolling window.
                let streak = match last_failure_at {
                    Some(prev) if now.duration_since(prev) <= self.settings.window => {
                        consecutive_failures + 1
                    }
                    _ => 1,
                };
                if streak >= self.settings.failure_threshold {
                    *inner = Inner::Open { since: now };
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures: streak,
                        last_failure_at: Some(now),
                    };
                }
            }
            Inner::Open { .. } => {}
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open { since: now };
            }
        }
    }

    /// Returns a half-open probe slot without recording an outcome
    ///
    /// Used when a probe call failed in a way that does not count against
    /// the breaker (a non-429 4xx): the slot frees up, the state stays.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if let Inner::HalfOpen { successes, inflight_probes } = *inner {
            *inner = Inner::HalfOpen {
                successes,
                inflight_probes: inflight_probes.saturating_sub(1),
            };
        }
    }

    /// Forces the breaker open, as if the failure threshold had been crossed
    pub fn trip_open(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        *inner = Inner::Open { since: Instant::now() };
    }

    fn roll_forward(&self, inner: &mut Inner) {
        if let Inner::Open { since } = *inner
            && since.elapsed() >= self.settings.open_cooldown
        {
            *inner = Inner::HalfOpen {
                successes: 0,
                inflight_probes: 0,
            };
        }
    }
}
