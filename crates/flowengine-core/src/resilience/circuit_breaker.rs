// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! A classic three-state circuit breaker: CLOSED -> OPEN -> HALF_OPEN -> CLOSED.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes: u32,
}

/// Trips OPEN after `failure_threshold` consecutive failures, stays OPEN for
/// `reset_timeout`, then allows `half_open_max_probes` trial calls through before
/// deciding whether to close again or re-open.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_probes: u32,
    name: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            half_open_max_probes: 1,
            name: name.into(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_probes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Call before attempting the guarded operation. Transitions OPEN -> HALF_OPEN
    /// once `reset_timeout` has elapsed.
    pub fn check(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.half_open_max_probes {
                    inner.half_open_probes += 1;
                    Ok(())
                } else {
                    Err(EngineError::Resource(format!(
                        "circuit breaker {} is half-open and at probe capacity",
                        self.name
                    )))
                }
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    debug!(circuit = %self.name, "transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes = 1;
                    Ok(())
                } else {
                    Err(EngineError::Resource(format!(
                        "circuit breaker {} is open ({:?} remaining)",
                        self.name,
                        self.reset_timeout - elapsed
                    )))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            debug!(circuit = %self.name, "closing after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_probes = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "probe failed, re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_probes = 0;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(circuit = %self.name, failures = inner.consecutive_failures, "opening circuit");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_millis(50));
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[test]
    fn half_opens_after_reset_timeout() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn closes_after_successful_probe() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.check().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
