use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// breaker state machine around one remote endpoint
///
/// opens after a run of failures, short-circuits calls while open, and
/// lets a single half-open probe through after the cooldown.
pub struct CircuitBreaker {
    endpoint: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// gate a call; fails with CircuitOpen while the breaker is open
    pub fn check(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    *state = State::HalfOpen;
                    tracing::debug!(endpoint = %self.endpoint, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after: until - now,
                    })
                }
            }
        }
    }

    /// record a successful call; closes the breaker
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, State::Closed { consecutive_failures: 0 }) {
            *state = State::Closed {
                consecutive_failures: 0,
            };
        }
    }

    /// record a failed call; trips the breaker at the threshold, and a
    /// failed half-open probe re-opens immediately
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(endpoint = %self.endpoint, failures, "circuit opened");
                    *state = State::Open {
                        until: Instant::now() + self.cooldown,
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen => {
                *state = State::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("blob", 3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen { .. })));
    }

    #[test]
    fn test_success_resets_failure_run() {
        let breaker = CircuitBreaker::new("blob", 2, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_half_open_probe() {
        let breaker = CircuitBreaker::new("blob", 1, Duration::from_millis(0));

        breaker.record_failure();
        // zero cooldown: next check transitions to half-open and passes
        assert!(breaker.check().is_ok());

        // failed probe re-opens; a success closes
        breaker.record_failure();
        // cooldown elapsed again
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert!(breaker.check().is_ok());
    }
}
