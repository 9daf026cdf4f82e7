//! Circuit breaker guarding calls to a Google API.
//!
//! Once a service has failed `failure_threshold` times in a row, requests to
//! it are rejected without touching the network until `reset_timeout` has
//! passed. The next request is then let through as a probe (half-open) and
//! `success_threshold` successes close the circuit again.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::Result;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests proceed
    Closed,
    /// Requests are rejected
    Open,
    /// Probing with live requests
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    /// Service name for logging
    pub name: String,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            name: name.into(),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

/// Tracks failures of one service.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!(service = %config.name, "Circuit breaker created");
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Reject the call with [`ApiError::CircuitOpen`] unless the circuit admits it.
    pub fn check(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= self.config.reset_timeout {
            state.state = CircuitState::HalfOpen;
            state.probe_successes = 0;
            info!(service = %self.config.name, "Circuit half-open, probing service");
            return Ok(());
        }

        Err(ApiError::CircuitOpen(self.config.name.clone()).into())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;

        if state.state == CircuitState::HalfOpen {
            state.probe_successes += 1;
            if state.probe_successes >= self.config.success_threshold {
                state.state = CircuitState::Closed;
                state.opened_at = None;
                info!(service = %self.config.name, "Circuit closed, service recovered");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;

        let trip = match state.state {
            CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            warn!(
                service = %self.config.name,
                failures = state.consecutive_failures,
                "Circuit opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}
