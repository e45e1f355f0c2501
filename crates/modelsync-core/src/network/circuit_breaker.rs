//! Circuit breaker for individual namenodes.
//!
//! A namenode that keeps failing is skipped until its recovery timeout
//! elapses, so failover goes straight to the next namenode instead of paying
//! a connect timeout on every call.
//! - CLOSED: requests flow through
//! - OPEN: requests are rejected immediately
//! - HALF_OPEN: a limited number of trial requests are allowed

use crate::config::NetworkDefaults;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait before probing again.
    pub recovery_timeout: Duration,
    /// Trial requests allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: NetworkDefaults::CIRCUIT_BREAKER_THRESHOLD,
            recovery_timeout: NetworkDefaults::CIRCUIT_BREAKER_RECOVERY_TIMEOUT,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

/// Circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    /// Endpoint this breaker protects (for logs).
    endpoint: String,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, CircuitBreakerConfig::default())
    }

    pub fn with_config(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_calls: 0,
            }),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state, moving OPEN to HALF_OPEN once the timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Check if a request should be allowed through.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                inner.half_open_calls += 1;
                inner.half_open_calls <= self.config.half_open_max_calls
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!("Circuit for {} recovered to CLOSED", self.endpoint);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_calls = 0;
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.endpoint, inner.consecutive_failures
            );
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened) = inner.opened_at {
            if opened.elapsed() >= self.config.recovery_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                debug!("Circuit for {} entering HALF_OPEN", self.endpoint);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
