//! Per-stage circuit breaker: CLOSED -> OPEN -> HALF_OPEN.
//!
//! The breaker opens after `threshold` consecutive failures. Once
//! `reset_after` has elapsed an open breaker admits exactly one trial
//! invocation (HALF_OPEN). A successful trial closes it; a failed trial
//! re-opens it and restarts the reset timer.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    reset_after: Duration,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(reset_after: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            reset_after,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Ask whether an invocation may proceed right now.
    ///
    /// Moves an expired OPEN breaker to HALF_OPEN and hands out the single
    /// trial slot.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_after)
                    .unwrap_or(false);
                if expired {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    /// Count a failure. Returns true if this failure opened the circuit.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;

        let should_open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= threshold.max(1),
            CircuitState::Open => false,
        };
        if should_open {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
        should_open
    }

    /// Force the breaker open with the given failure streak, starting a
    /// fresh reset timer.
    pub fn trip(&mut self, consecutive_failures: u32) {
        self.state = CircuitState::Open;
        self.consecutive_failures = consecutive_failures;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }

    /// Close the breaker and forget the failure streak.
    pub fn reset(&mut self) {
        self.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert!(!breaker.record_failure(3));
        assert!(!breaker.record_failure(3));
        assert!(breaker.record_failure(3));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_clears_streak() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60));
        breaker.record_failure(3);
        breaker.record_failure(3);
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.record_failure(3));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(10));
        breaker.record_failure(1);
        assert!(!breaker.try_acquire());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // only one trial at a time
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(10));
        breaker.record_failure(1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.try_acquire());

        assert!(breaker.record_failure(5));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_manual_reset() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(3600));
        breaker.record_failure(1);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }
}
