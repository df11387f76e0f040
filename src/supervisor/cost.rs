//! LLM cost governance.
//!
//! Every call is priced from a provider/model rate table and added to daily
//! and monthly running totals. Totals roll over on UTC date boundaries.
//!
//! Crossing a ceiling makes the crossing call return [`BudgetExceeded`]
//! (the call is still recorded, the money is already spent). Once over, any
//! further call in the same period is rejected up front and not recorded;
//! [`CostTracking::check_budget`] lets a caller ask before spending.
//!
//! The ledger is plain data ([`CostSummary`]) so it can be persisted and
//! restored across runs and restarts.

use crate::config::pattern_matches;
use crate::errors::{BudgetExceeded, BudgetPeriod};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Price per thousand tokens for a provider/model pair.
///
/// `model` may be a glob (`claude-sonnet-*`, `*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub provider: String,
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelRate {
    pub fn new(provider: &str, model: &str, input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            input_per_1k,
            output_per_1k,
        }
    }

    fn matches(&self, provider: &str, model: &str) -> bool {
        (self.provider == "*" || self.provider.eq_ignore_ascii_case(provider))
            && pattern_matches(&self.model, model)
    }

    pub fn price(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 / 1000.0) * self.input_per_1k
            + (tokens_out as f64 / 1000.0) * self.output_per_1k
    }
}

/// Built-in rates, consulted after any configured ones.
pub fn default_rates() -> Vec<ModelRate> {
    vec![
        ModelRate::new("openai", "gpt-4o-mini*", 0.00015, 0.0006),
        ModelRate::new("openai", "gpt-4o*", 0.0025, 0.01),
        ModelRate::new("openai", "o1*", 0.015, 0.06),
        ModelRate::new("openai", "*", 0.0025, 0.01),
        ModelRate::new("anthropic", "claude-*haiku*", 0.0008, 0.004),
        ModelRate::new("anthropic", "claude-*opus*", 0.015, 0.075),
        ModelRate::new("anthropic", "claude-*sonnet*", 0.003, 0.015),
        ModelRate::new("anthropic", "*", 0.003, 0.015),
        ModelRate::new("ollama", "*", 0.0, 0.0),
        ModelRate::new("*", "*", 0.003, 0.015),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_budget: Option<f64>,
    /// Extra rates, matched before the built-in table
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rates: Vec<ModelRate>,
}

fn default_enabled() -> bool {
    true
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            daily_budget: None,
            monthly_budget: None,
            rates: Vec::new(),
        }
    }
}

/// One LLM call to account for.
#[derive(Debug, Clone)]
pub struct LlmUsage {
    pub model: String,
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub stage: String,
    pub purpose: String,
}

/// What an accepted call cost and where the totals stand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub cost: f64,
    pub daily_total: f64,
    pub monthly_total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub daily_cost: f64,
    pub monthly_cost: f64,
    pub calls: u64,
    pub rejected_calls: u64,
    pub by_stage: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_budget: Option<f64>,
    /// UTC day the daily and monthly totals belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<NaiveDate>,
}

impl CostSummary {
    /// Number of calls this ledger has seen, accepted or not.
    pub fn seen_calls(&self) -> u64 {
        self.calls + self.rejected_calls
    }

    /// True when `self` is at least as recent as `other`: a later day, or
    /// the same day with no fewer calls seen.
    pub fn supersedes(&self, other: &CostSummary) -> bool {
        (self.as_of, self.seen_calls()) >= (other.as_of, other.seen_calls())
    }
}

/// Cost accounting capability injected into the supervisor.
pub trait CostTracking: Send + Sync {
    fn track_llm_call(&self, usage: &LlmUsage) -> Result<CostRecord, BudgetExceeded>;

    /// Fails when a ceiling is already exhausted. Nothing is recorded
    /// besides the rejection.
    fn check_budget(&self) -> Result<(), BudgetExceeded>;

    fn summary(&self) -> CostSummary;

    /// Replace the running totals with a persisted ledger.
    fn restore(&self, summary: &CostSummary);
}

#[derive(Debug, Default)]
struct Ledger {
    day: Option<NaiveDate>,
    month: Option<(i32, u32)>,
    daily: f64,
    monthly: f64,
    total: f64,
    calls: u64,
    rejected: u64,
    by_stage: BTreeMap<String, f64>,
    by_model: BTreeMap<String, f64>,
}

impl Ledger {
    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily = 0.0;
        }
        let month = (now.year(), now.month());
        if self.month != Some(month) {
            self.month = Some(month);
            self.monthly = 0.0;
        }
    }
}

pub struct CostTracker {
    config: CostConfig,
    ledger: Mutex<Ledger>,
}

impl CostTracker {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Rate used for a provider/model pair: configured rates first, then the
    /// built-in table (which ends in a catch-all).
    pub fn rate_for(&self, provider: &str, model: &str) -> ModelRate {
        self.config
            .rates
            .iter()
            .cloned()
            .chain(default_rates())
            .find(|rate| rate.matches(provider, model))
            .unwrap_or_else(|| ModelRate::new("*", "*", 0.0, 0.0))
    }

    fn limits(&self) -> [(BudgetPeriod, Option<f64>); 2] {
        [
            (BudgetPeriod::Daily, self.config.daily_budget),
            (BudgetPeriod::Monthly, self.config.monthly_budget),
        ]
    }

    /// First ceiling `ledger` has reached, if any.
    fn exhausted(&self, ledger: &Ledger) -> Option<BudgetExceeded> {
        self.limits().into_iter().find_map(|(period, limit)| {
            let limit = limit?;
            let spent = match period {
                BudgetPeriod::Daily => ledger.daily,
                BudgetPeriod::Monthly => ledger.monthly,
            };
            (spent >= limit).then_some(BudgetExceeded {
                period,
                spent,
                limit,
            })
        })
    }

    /// Budget check at an explicit time.
    pub fn check_at(&self, now: DateTime<Utc>) -> Result<(), BudgetExceeded> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.roll_over(now);
        match self.exhausted(&ledger) {
            Some(exceeded) => {
                ledger.rejected += 1;
                warn!(
                    period = %exceeded.period,
                    spent = exceeded.spent,
                    limit = exceeded.limit,
                    "LLM call refused: budget already exhausted"
                );
                Err(exceeded)
            }
            None => Ok(()),
        }
    }

    /// Account for a call at an explicit time.
    pub fn track_at(
        &self,
        usage: &LlmUsage,
        now: DateTime<Utc>,
    ) -> Result<CostRecord, BudgetExceeded> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.roll_over(now);

        if let Some(exceeded) = self.exhausted(&ledger) {
            ledger.rejected += 1;
            warn!(
                stage = %usage.stage,
                model = %usage.model,
                period = %exceeded.period,
                spent = exceeded.spent,
                limit = exceeded.limit,
                "LLM call rejected: budget already exhausted"
            );
            return Err(exceeded);
        }

        let cost = self
            .rate_for(&usage.provider, &usage.model)
            .price(usage.tokens_in, usage.tokens_out);
        ledger.daily += cost;
        ledger.monthly += cost;
        ledger.total += cost;
        ledger.calls += 1;
        *ledger.by_stage.entry(usage.stage.clone()).or_default() += cost;
        *ledger
            .by_model
            .entry(format!("{}/{}", usage.provider, usage.model))
            .or_default() += cost;

        debug!(
            stage = %usage.stage,
            model = %usage.model,
            purpose = %usage.purpose,
            cost,
            "Tracked LLM call"
        );

        for (period, limit) in self.limits() {
            let Some(limit) = limit else { continue };
            let spent = match period {
                BudgetPeriod::Daily => ledger.daily,
                BudgetPeriod::Monthly => ledger.monthly,
            };
            if spent > limit {
                warn!(%period, spent, limit, "Budget ceiling crossed");
                return Err(BudgetExceeded {
                    period,
                    spent,
                    limit,
                });
            }
        }

        Ok(CostRecord {
            cost,
            daily_total: ledger.daily,
            monthly_total: ledger.monthly,
        })
    }
}

impl CostTracking for CostTracker {
    fn track_llm_call(&self, usage: &LlmUsage) -> Result<CostRecord, BudgetExceeded> {
        self.track_at(usage, Utc::now())
    }

    fn check_budget(&self) -> Result<(), BudgetExceeded> {
        self.check_at(Utc::now())
    }

    fn summary(&self) -> CostSummary {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        CostSummary {
            total_cost: ledger.total,
            daily_cost: ledger.daily,
            monthly_cost: ledger.monthly,
            calls: ledger.calls,
            rejected_calls: ledger.rejected,
            by_stage: ledger.by_stage.clone(),
            by_model: ledger.by_model.clone(),
            daily_budget: self.config.daily_budget,
            monthly_budget: self.config.monthly_budget,
            as_of: ledger.day,
        }
    }

    fn restore(&self, summary: &CostSummary) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        *ledger = Ledger {
            day: summary.as_of,
            month: summary.as_of.map(|day| (day.year(), day.month())),
            daily: summary.daily_cost,
            monthly: summary.monthly_cost,
            total: summary.total_cost,
            calls: summary.calls,
            rejected: summary.rejected_calls,
            by_stage: summary.by_stage.clone(),
            by_model: summary.by_model.clone(),
        };
        debug!(calls = summary.calls, daily = summary.daily_cost, "Restored cost ledger");
    }
}
