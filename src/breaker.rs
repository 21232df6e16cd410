//! Circuit breaker guarding the upstream provider.
//!
//! Three states: Closed (normal traffic), Open (shedding after repeated
//! failures), HalfOpen (limited probes after the recovery window).
//! `can_execute` is the single admission gate; its side effects — the
//! Open-to-HalfOpen transition and the probe count — are taken under the
//! same lock as the decision. State is process-local: each replica
//! judges upstream health on its own traffic.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; failures are counted
    Closed,
    /// Tripped; requests are shed without touching the upstream
    Open,
    /// Probing recovery with a bounded number of trial requests
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

    /// Gauge encoding: 0=closed, 1=half_open, 2=open.
    pub fn code(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub reset_at: Option<String>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_calls: u32,
    ) -> Self {
        info!(
            failure_threshold,
            recovery_timeout_secs = recovery_timeout.as_secs(),
            half_open_max_calls,
            "circuit breaker ready"
        );
        metrics::CIRCUIT_BREAKER_STATE.set(CircuitState::Closed.code());
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                opened_at: None,
                opened_at_wall: None,
            }),
        }
    }

    /// Admission gate: decide whether a request may reach the upstream.
    ///
    /// In Open state, once the recovery window has elapsed, the circuit
    /// moves to HalfOpen and the admitted request counts as the first
    /// probe; in HalfOpen, at most `half_open_max_calls` probes pass.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(false);
                if elapsed {
                    info!("circuit open -> half_open (recovery timeout elapsed)");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_calls = 1;
                    metrics::CIRCUIT_BREAKER_STATE.set(CircuitState::HalfOpen.code());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.half_open_max_calls {
                    info!("circuit half_open -> closed (recovery confirmed)");
                    Self::close(&mut inner);
                }
            }
            // A success landing after the trip changes nothing
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "circuit closed -> open"
                    );
                    Self::open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit half_open -> open (probe failed)");
                Self::open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn open(inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        metrics::CIRCUIT_BREAKER_STATE.set(CircuitState::Open.code());
    }

    fn close(inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        metrics::CIRCUIT_BREAKER_STATE.set(CircuitState::Closed.code());
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn state_code(&self) -> i64 {
        self.state().code()
    }

    /// When an open circuit will admit its next probe, if known.
    pub fn reset_time(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open {
            inner
                .opened_at_wall
                .map(|at| at + chrono::Duration::seconds(self.recovery_timeout.as_secs() as i64))
        } else {
            None
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let reset_at = self.reset_time().map(|t| t.to_rfc3339());
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            state: inner.state.as_str().to_string(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs(),
            reset_at,
        }
    }
}
