//! Per-stage health counters and the aggregated report.

use super::circuit::CircuitState;
use super::cost::CostSummary;
use super::sandbox::SandboxStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageHealth {
    /// Invocations of the underlying stage
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    #[serde(default)]
    pub circuit_state: CircuitState,
    #[serde(default)]
    pub timeouts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StageHealth {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

/// Snapshot of everything the supervisor knows about a card's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub card_id: String,
    pub stages: BTreeMap<String, StageHealth>,
    pub total_attempts: u32,
    pub total_failures: u32,
    pub open_circuits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxStats>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(
        card_id: &str,
        stages: BTreeMap<String, StageHealth>,
        cost: Option<CostSummary>,
        sandbox: Option<SandboxStats>,
    ) -> Self {
        let total_attempts = stages.values().map(|s| s.attempts).sum();
        let total_failures = stages.values().map(|s| s.failures).sum();
        let open_circuits = stages
            .iter()
            .filter(|(_, h)| h.circuit_open)
            .map(|(name, _)| name.clone())
            .collect();
        Self {
            card_id: card_id.to_string(),
            stages,
            total_attempts,
            total_failures,
            open_circuits,
            cost,
            sandbox,
            generated_at: Utc::now(),
        }
    }

    /// No open circuits.
    pub fn is_healthy(&self) -> bool {
        self.open_circuits.is_empty()
    }
}
