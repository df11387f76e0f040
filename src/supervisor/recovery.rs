//! Per-stage retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry, backoff, circuit and timeout settings for one supervised stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    /// Retries after the first attempt; a stage runs at most `max_retries + 1` times
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive failures that open the circuit
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Budget for the whole attempt sequence, backoff sleeps included
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_timeout_seconds() -> f64 {
    300.0
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl RecoveryStrategy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, seconds: f64) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sleep before retry number `attempt` (1-based):
    /// `retry_delay_seconds * backoff_multiplier^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let seconds = self.retry_delay_seconds * self.backoff_multiplier.powi(exponent);
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }

    /// Bound on the attempt sequence. A zero, negative or non-finite
    /// setting falls back to the default rather than expiring immediately.
    pub fn timeout(&self) -> Duration {
        if self.timeout_seconds.is_finite() && self.timeout_seconds > 0.0 {
            Duration::from_secs_f64(self.timeout_seconds)
        } else {
            Duration::from_secs_f64(default_timeout_seconds())
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retry_delay_seconds < 0.0 || !self.retry_delay_seconds.is_finite() {
            return Err(format!(
                "retry_delay_seconds must be a non-negative number (got {})",
                self.retry_delay_seconds
            ));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(format!(
                "backoff_multiplier must be at least 1.0 (got {})",
                self.backoff_multiplier
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err("circuit_breaker_threshold must be at least 1".to_string());
        }
        if self.timeout_seconds <= 0.0 || !self.timeout_seconds.is_finite() {
            return Err(format!(
                "timeout_seconds must be positive (got {})",
                self.timeout_seconds
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RecoveryStrategy::default();
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.retry_delay_seconds, 1.0);
        assert_eq!(s.backoff_multiplier, 2.0);
        assert_eq!(s.circuit_breaker_threshold, 5);
        assert_eq!(s.timeout_seconds, 300.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_exponential_delay() {
        let s = RecoveryStrategy::default()
            .with_retry_delay(0.5)
            .with_backoff_multiplier(3.0);
        assert_eq!(s.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(s.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(s.delay_for_attempt(3), Duration::from_millis(4500));
    }

    #[test]
    fn test_zero_delay() {
        let s = RecoveryStrategy::default().with_retry_delay(0.0);
        assert_eq!(s.delay_for_attempt(4), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RecoveryStrategy::default()
            .with_backoff_multiplier(0.5)
            .validate()
            .is_err());
        assert!(RecoveryStrategy::default()
            .with_circuit_breaker_threshold(0)
            .validate()
            .is_err());
        assert!(RecoveryStrategy::default().with_timeout(0.0).validate().is_err());
        assert!(RecoveryStrategy::default()
            .with_retry_delay(-1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_unusable_timeout_falls_back_to_default() {
        let default = Duration::from_secs(300);
        assert_eq!(RecoveryStrategy::default().with_timeout(0.0).timeout(), default);
        assert_eq!(RecoveryStrategy::default().with_timeout(-5.0).timeout(), default);
        assert_eq!(RecoveryStrategy::default().with_timeout(f64::NAN).timeout(), default);
        assert_eq!(
            RecoveryStrategy::default().with_timeout(2.5).timeout(),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_partial_toml() {
        let s: RecoveryStrategy = toml::from_str("max_retries = 7").unwrap();
        assert_eq!(s.max_retries, 7);
        assert_eq!(s.timeout_seconds, 300.0);
    }
}
