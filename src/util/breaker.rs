//! A small counting circuit breaker.
//!
//! Opens after `threshold` failures inside a rolling window, rejects callers
//! while open, and lets a single probe through once `reset_after` has
//! elapsed (half-open). A successful probe closes the breaker; a failed one
//! re-opens it for another full period.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
#[error("circuit open, retry in {retry_in:?}")]
pub struct CircuitOpen {
    pub retry_in: Duration,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32, window_start: Option<Instant> },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    window: Duration,
    /// How long the breaker stays open before admitting a probe.
    reset_after: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration, reset_after: Duration) -> Self {
        Self {
            threshold,
            window,
            reset_after,
            state: Mutex::new(State::Closed {
                failures: 0,
                window_start: None,
            }),
        }
    }

    /// Ask permission to perform the guarded call.
    ///
    /// # Errors
    /// [`CircuitOpen`] while the breaker is open and the reset period has
    /// not elapsed.
    pub fn acquire(&self) -> Result<(), CircuitOpen> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.reset_after {
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        retry_in: self.reset_after - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = State::Closed {
            failures: 0,
            window_start: None,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match *state {
            State::HalfOpen | State::Open { .. } => {
                *state = State::Open { since: now };
            }
            State::Closed {
                failures,
                window_start,
            } => {
                let (failures, window_start) = match window_start {
                    Some(start) if now.duration_since(start) <= self.window => {
                        (failures + 1, start)
                    }
                    _ => (1, now),
                };
                if failures >= self.threshold {
                    *state = State::Open { since: now };
                } else {
                    *state = State::Closed {
                        failures,
                        window_start: Some(window_start),
                    };
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().expect("breaker lock poisoned");
        matches!(*state, State::Open { since } if since.elapsed() < self.reset_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_millis(20))
    }

    #[test]
    fn opens_at_threshold() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        assert!(b.acquire().is_ok());
        b.record_failure();
        assert!(b.acquire().is_err());
        assert!(b.is_open());
    }

    #[test]
    fn success_resets_count() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert!(b.acquire().is_ok());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.acquire().is_err());
        std::thread::sleep(Duration::from_millis(25));
        // Probe admitted after the reset period.
        assert!(b.acquire().is_ok());
        b.record_success();
        assert!(b.acquire().is_ok());
        assert!(!b.is_open());
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.acquire().is_ok());
        b.record_failure();
        assert!(b.acquire().is_err());
    }
}
