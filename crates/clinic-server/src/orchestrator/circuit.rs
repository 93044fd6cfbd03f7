//! Circuit breaker in front of the agent backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { probing: bool },
}

/// Public view of the breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Calls flow.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

/// Gates agent backend calls after repeated failures.
///
/// N consecutive failures open the circuit; after the cooldown one trial
/// call is let through (half-open); its success closes the circuit and its
/// failure re-opens it.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Breaker that opens after `threshold` consecutive failures.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Whether a call may proceed. Claims the trial slot when half-open.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    info!("circuit breaker half-open, allowing trial call");
                    *state = CircuitState::HalfOpen { probing: true };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { probing: true } => false,
            CircuitState::HalfOpen { probing: false } => {
                *state = CircuitState::HalfOpen { probing: true };
                true
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write();
        let trip = match *state {
            CircuitState::Closed => failures >= self.threshold,
            CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { .. } => false,
        };
        if trip {
            warn!(
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Release a half-open trial slot without a verdict (cancelled call).
    pub fn release_trial(&self) {
        let mut state = self.state.write();
        if *state == (CircuitState::HalfOpen { probing: true }) {
            *state = CircuitState::HalfOpen { probing: false };
        }
    }

    /// Current state.
    pub fn status(&self) -> CircuitStatus {
        match *self.state.read() {
            CircuitState::Closed => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    /// State name for logs and metrics.
    pub fn state_name(&self) -> &'static str {
        match self.status() {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}
