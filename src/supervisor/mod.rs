//! Stage supervision: retries with exponential backoff, per-stage circuit
//! breakers, recovery workflows between attempts, cost accounting and
//! sandboxed code execution.
//!
//! Each stage owns one [`CircuitBreaker`] and one [`StageHealth`] record for
//! the lifetime of the supervisor. Counters are shared between concurrent
//! supervised calls, so a parallel run still trips the breaker after the
//! configured number of consecutive failures.

pub mod circuit;
pub mod cost;
pub mod health;
pub mod recovery;
pub mod sandbox;

pub use circuit::{CircuitBreaker, CircuitState};
pub use cost::{CostConfig, CostRecord, CostSummary, CostTracker, CostTracking, LlmUsage};
pub use health::{HealthReport, StageHealth};
pub use recovery::RecoveryStrategy;
pub use sandbox::{CodeSandbox, ExecutionResult, ProcessSandbox, SandboxConfig, SandboxStats};

use crate::config::{PipewrightConfig, SupervisorSection};
use crate::errors::{BudgetExceeded, ConfigError, StageError};
use crate::state::{STAGE_KEY, SharedMachine};
use crate::store::PipelineStore;
use crate::workflow::{RecoveryContext, classify};
use anyhow::{Result, anyhow, bail};
use futures::FutureExt;
use pipewright_common::PipelineState;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct StageSlot {
    health: StageHealth,
    breaker: CircuitBreaker,
}

impl StageSlot {
    fn new(reset_after: Duration) -> Self {
        Self {
            health: StageHealth::default(),
            breaker: CircuitBreaker::new(reset_after),
        }
    }

    /// Copy breaker state into the health record.
    fn sync(&mut self) {
        self.health.consecutive_failures = self.breaker.consecutive_failures();
        self.health.circuit_state = self.breaker.state();
        self.health.circuit_open = self.breaker.state() == CircuitState::Open;
    }
}

pub struct Supervisor {
    card_id: String,
    strategies: SupervisorSection,
    registered: HashMap<String, RecoveryStrategy>,
    circuit_reset: Duration,
    stages: Mutex<HashMap<String, StageSlot>>,
    cost: Option<Arc<dyn CostTracking>>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    machine: Option<SharedMachine>,
    store: Option<Arc<dyn PipelineStore>>,
    working_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    cancel: Option<CancellationToken>,
}

impl Supervisor {
    /// Supervisor with default strategies and no optional capabilities.
    pub fn new(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            strategies: SupervisorSection::default(),
            registered: HashMap::new(),
            circuit_reset: Duration::from_secs(60),
            stages: Mutex::new(HashMap::new()),
            cost: None,
            sandbox: None,
            machine: None,
            store: None,
            working_dir: None,
            state_dir: None,
            cancel: None,
        }
    }

    /// Build from project configuration: strategies, circuit reset, and the
    /// cost tracker and sandbox when they are enabled.
    pub fn from_config(card_id: &str, config: &PipewrightConfig) -> Self {
        let toml = &config.toml;
        let mut supervisor = Self::new(card_id)
            .with_strategies(toml.supervisor.clone())
            .with_circuit_reset(Duration::from_secs_f64(
                toml.engine.circuit_reset_seconds.max(0.0),
            ))
            .with_working_dir(config.project_dir.clone())
            .with_state_dir(config.state_dir());
        if toml.cost.enabled {
            supervisor = supervisor.with_cost_tracking(Arc::new(CostTracker::new(toml.cost.clone())));
        }
        if toml.sandbox.enabled {
            supervisor = supervisor.with_sandbox(Arc::new(ProcessSandbox::new(toml.sandbox.clone())));
        }
        supervisor
    }

    pub fn with_strategies(mut self, strategies: SupervisorSection) -> Self {
        self.strategies = strategies;
        self
    }

    /// Strategy for stages without an override. An invalid strategy is
    /// logged; its unusable timeout falls back to the default.
    pub fn with_default_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        if let Err(message) = strategy.validate() {
            warn!(card_id = %self.card_id, %message, "Invalid default recovery strategy");
        }
        self.strategies.default = strategy;
        self
    }

    pub fn with_circuit_reset(mut self, reset_after: Duration) -> Self {
        self.circuit_reset = reset_after;
        self
    }

    pub fn with_cost_tracking(mut self, tracker: Arc<dyn CostTracking>) -> Self {
        self.cost = Some(tracker);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Run recovery workflows against `machine` between attempts.
    pub fn with_state_machine(mut self, machine: SharedMachine) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Persist the health report after every supervised sequence.
    pub fn with_store(mut self, store: Arc<dyn PipelineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Stop retrying once `cancel` fires. The attempt in progress is not
    /// interrupted.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Pin an explicit strategy for one stage, bypassing configured overrides.
    pub fn register_strategy(
        &mut self,
        stage_name: &str,
        strategy: RecoveryStrategy,
    ) -> Result<(), ConfigError> {
        strategy
            .validate()
            .map_err(|message| ConfigError::InvalidStrategy {
                stage: stage_name.to_string(),
                message,
            })?;
        self.registered.insert(stage_name.to_string(), strategy);
        Ok(())
    }

    pub fn strategy_for(&self, stage_name: &str) -> RecoveryStrategy {
        self.registered
            .get(stage_name)
            .cloned()
            .unwrap_or_else(|| self.strategies.strategy_for(stage_name))
    }

    /// Run `stage` under supervision.
    ///
    /// `stage` receives the 1-based attempt number. Failed attempts are
    /// retried up to `max_retries` times with exponential backoff; between
    /// attempts the failure is classified and its recovery workflow runs on
    /// the attached state machine. The stage is not invoked at all while its
    /// circuit is open. The whole sequence is bounded by `timeout_seconds`.
    #[tracing::instrument(skip(self, stage), fields(card_id = %self.card_id))]
    pub async fn execute_with_supervision<T, F, Fut>(
        &self,
        stage_name: &str,
        mut stage: F,
    ) -> Result<T, StageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let strategy = self.strategy_for(stage_name);
        let attempts = AtomicU32::new(0);
        self.enter_stage(stage_name);

        let sequence = async {
            let max_attempts = strategy.max_retries.saturating_add(1);
            for attempt in 1..=max_attempts {
                if attempt > 1 && self.is_cancelled() {
                    info!(stage = stage_name, attempt, "Cancelled; not retrying");
                    return Err(StageError::Cancelled {
                        stage: stage_name.to_string(),
                    });
                }
                if let Err(consecutive_failures) = self.acquire(stage_name) {
                    warn!(
                        stage = stage_name,
                        consecutive_failures, "Circuit open; failing fast"
                    );
                    return Err(StageError::CircuitOpen {
                        stage: stage_name.to_string(),
                        attempts: attempts.load(Ordering::SeqCst),
                        consecutive_failures,
                    });
                }

                attempts.store(attempt, Ordering::SeqCst);
                let outcome = AssertUnwindSafe(stage(attempt))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(anyhow!("stage panicked: {}", panic_message(payload.as_ref())))
                    });
                match outcome {
                    Ok(value) => {
                        self.record_success(stage_name);
                        if attempt > 1 {
                            info!(stage = stage_name, attempt, "Stage succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(err) => {
                        let message = format!("{err:#}");
                        self.record_failure(stage_name, &message, strategy.circuit_breaker_threshold);
                        if attempt == max_attempts {
                            return Err(StageError::RetriesExhausted {
                                stage: stage_name.to_string(),
                                attempts: attempt,
                                last_error: message,
                            });
                        }

                        let delay = strategy.delay_for_attempt(attempt);
                        warn!(
                            stage = stage_name,
                            attempt,
                            error = %message,
                            delay_ms = delay.as_millis() as u64,
                            "Stage attempt failed; retrying"
                        );
                        self.recover(stage_name, attempt, &message).await;
                        match &self.cancel {
                            Some(cancel) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                            None => tokio::time::sleep(delay).await,
                        }
                    }
                }
            }
            // max_attempts >= 1, so the loop always returns
            Err(StageError::RetriesExhausted {
                stage: stage_name.to_string(),
                attempts: attempts.load(Ordering::SeqCst),
                last_error: "no attempts made".to_string(),
            })
        };

        let result = match tokio::time::timeout(strategy.timeout(), sequence).await {
            Ok(result) => result,
            Err(_) => {
                let seconds = strategy.timeout_seconds;
                self.record_timeout(stage_name, seconds, strategy.circuit_breaker_threshold);
                Err(StageError::Timeout {
                    stage: stage_name.to_string(),
                    attempts: attempts.load(Ordering::SeqCst),
                    seconds,
                })
            }
        };

        self.leave_stage(stage_name);
        self.persist_health();
        result
    }

    /// Account for an LLM call. Without a cost tracker every call is free.
    pub fn track_llm_call(
        &self,
        model: &str,
        provider: &str,
        tokens_in: u64,
        tokens_out: u64,
        stage: &str,
        purpose: &str,
    ) -> Result<CostRecord, BudgetExceeded> {
        let Some(tracker) = &self.cost else {
            return Ok(CostRecord {
                cost: 0.0,
                daily_total: 0.0,
                monthly_total: 0.0,
            });
        };
        let usage = LlmUsage {
            model: model.to_string(),
            provider: provider.to_string(),
            tokens_in,
            tokens_out,
            stage: stage.to_string(),
            purpose: purpose.to_string(),
        };
        let result = tracker.track_llm_call(&usage);
        self.persist_cost_ledger(tracker.as_ref());
        result
    }

    /// Refuse a call up front when a budget ceiling is already exhausted.
    /// Call this before issuing a request; [`track_llm_call`](Self::track_llm_call)
    /// only sees the tokens afterwards.
    pub fn check_budget(&self) -> Result<(), BudgetExceeded> {
        let Some(tracker) = &self.cost else {
            return Ok(());
        };
        let result = tracker.check_budget();
        if result.is_err() {
            self.persist_cost_ledger(tracker.as_ref());
        }
        result
    }

    fn persist_cost_ledger(&self, tracker: &dyn CostTracking) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_cost_ledger(&tracker.summary()) {
            error!(card_id = %self.card_id, error = %e, "Failed to persist cost ledger");
        }
    }

    /// Run untrusted code in the sandbox.
    pub async fn execute_code_safely(
        &self,
        code: &str,
        scan_security: bool,
    ) -> Result<ExecutionResult> {
        let Some(sandbox) = &self.sandbox else {
            bail!("Sandboxed execution is disabled for card {}", self.card_id);
        };
        sandbox.execute(code, scan_security).await
    }

    /// Health, cost and sandbox statistics for every stage seen so far.
    pub fn get_statistics(&self) -> HealthReport {
        let stages: BTreeMap<String, StageHealth> = {
            let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter_mut()
                .map(|(name, slot)| {
                    slot.sync();
                    (name.clone(), slot.health.clone())
                })
                .collect()
        };
        HealthReport::new(
            &self.card_id,
            stages,
            self.cost.as_ref().map(|c| c.summary()),
            self.sandbox.as_ref().map(|s| s.stats()),
        )
    }

    pub fn stage_health(&self, stage_name: &str) -> Option<StageHealth> {
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get_mut(stage_name).map(|slot| {
            slot.sync();
            slot.health.clone()
        })
    }

    /// Close a stage's circuit by hand. False if the stage was never run.
    pub fn reset_circuit(&self, stage_name: &str) -> bool {
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.get_mut(stage_name) else {
            return false;
        };
        slot.breaker.reset();
        slot.sync();
        info!(card_id = %self.card_id, stage = stage_name, "Circuit reset");
        true
    }

    /// Seed counters from a persisted report. Circuits that were open are
    /// reopened with a fresh reset timer.
    pub fn restore_health(&self, report: &HealthReport) {
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, health) in &report.stages {
            let slot = slots
                .entry(name.clone())
                .or_insert_with(|| StageSlot::new(self.circuit_reset));
            slot.health = health.clone();
            if health.circuit_open {
                slot.breaker.trip(health.consecutive_failures);
            }
            slot.sync();
        }
        debug!(card_id = %self.card_id, stages = report.stages.len(), "Restored stage health");
    }

    fn acquire(&self, stage_name: &str) -> Result<(), u32> {
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(stage_name.to_string())
            .or_insert_with(|| StageSlot::new(self.circuit_reset));
        let allowed = slot.breaker.try_acquire();
        slot.sync();
        if allowed {
            slot.health.attempts += 1;
            Ok(())
        } else {
            Err(slot.breaker.consecutive_failures())
        }
    }

    fn record_success(&self, stage_name: &str) {
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(stage_name) {
            slot.health.successes += 1;
            slot.breaker.record_success();
            slot.sync();
        }
    }

    fn record_failure(&self, stage_name: &str, message: &str, threshold: u32) {
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(stage_name.to_string())
            .or_insert_with(|| StageSlot::new(self.circuit_reset));
        slot.health.failures += 1;
        slot.health.last_error = Some(message.to_string());
        if slot.breaker.record_failure(threshold) {
            warn!(
                card_id = %self.card_id,
                stage = stage_name,
                consecutive_failures = slot.breaker.consecutive_failures(),
                "Circuit opened"
            );
        }
        slot.sync();
    }

    fn record_timeout(&self, stage_name: &str, seconds: f64, threshold: u32) {
        self.record_failure(stage_name, &format!("timed out after {seconds}s"), threshold);
        let mut slots = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(stage_name) {
            slot.health.timeouts += 1;
        }
    }

    fn enter_stage(&self, stage_name: &str) {
        let Some(machine) = &self.machine else {
            return;
        };
        let Ok(mut machine) = machine.lock() else {
            warn!(stage = stage_name, "State machine lock poisoned");
            return;
        };
        machine.push_state(PipelineState::StageRunning, stage_metadata(stage_name, None));
    }

    fn leave_stage(&self, stage_name: &str) {
        let Some(machine) = &self.machine else {
            return;
        };
        let Ok(mut machine) = machine.lock() else {
            warn!(stage = stage_name, "State machine lock poisoned");
            return;
        };
        machine.unwind_stage(stage_name);
    }

    /// Classify the failure and run its recovery workflow. Returns whether
    /// the workflow resolved the issue.
    async fn recover(&self, stage_name: &str, attempt: u32, message: &str) -> bool {
        let Some(machine) = &self.machine else {
            return false;
        };
        let issue = classify(message);
        let mut context = RecoveryContext::new(&self.card_id)
            .with_stage(stage_name)
            .with_error(message)
            .with_attempt(attempt);
        if let Some(dir) = &self.working_dir {
            context = context.with_working_dir(dir.clone());
        }
        if let Some(dir) = &self.state_dir {
            context = context.with_state_dir(dir.clone());
        }

        let engine = {
            let Ok(mut machine) = machine.lock() else {
                warn!(stage = stage_name, "State machine lock poisoned; skipping recovery");
                return false;
            };
            machine.push_state(
                PipelineState::Recovering,
                stage_metadata(stage_name, Some(attempt)),
            );
            machine.register_issue(issue, &context);
            machine.workflows()
        };

        // run outside the machine lock; handlers await processes and sockets
        let run = AssertUnwindSafe(engine.execute(issue, &context))
            .catch_unwind()
            .await;
        let resolved = match run {
            Ok(Ok(run)) => {
                info!(
                    stage = stage_name,
                    %issue,
                    workflow = %run.workflow,
                    success = run.success,
                    duration_seconds = run.duration_seconds,
                    "Recovery workflow finished"
                );
                run.success
            }
            Ok(Err(e)) => {
                error!(stage = stage_name, %issue, error = %e, "Recovery workflow could not run");
                false
            }
            Err(payload) => {
                error!(
                    stage = stage_name,
                    %issue,
                    error = %panic_message(payload.as_ref()),
                    "Recovery workflow panicked"
                );
                false
            }
        };

        if let Ok(mut machine) = machine.lock() {
            machine.record_workflow_result(issue, resolved);
        }
        resolved
    }

    fn persist_health(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let report = self.get_statistics();
        if let Err(e) = store.save_health(&self.card_id, &report) {
            error!(card_id = %self.card_id, error = %e, "Failed to persist health report");
        }
    }
}

/// Text of a panic payload, when it carries one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn stage_metadata(stage_name: &str, attempt: Option<u32>) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(STAGE_KEY.to_string(), stage_name.to_string());
    if let Some(attempt) = attempt {
        metadata.insert("attempt".to_string(), attempt.to_string());
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineStateMachine;
    use crate::store::MemoryStore;
    use crate::workflow::WorkflowEngine;
    use anyhow::anyhow;
    use pipewright_common::IssueType;
    use std::sync::atomic::AtomicUsize;

    fn fast_strategy(max_retries: u32, threshold: u32) -> RecoveryStrategy {
        RecoveryStrategy::default()
            .with_max_retries(max_retries)
            .with_retry_delay(0.0)
            .with_circuit_breaker_threshold(threshold)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let supervisor = Supervisor::new("c-1").with_default_strategy(fast_strategy(2, 10));
        let calls = AtomicUsize::new(0);

        let result = supervisor
            .execute_with_supervision("build", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(anyhow!("flaky"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let health = supervisor.stage_health("build").unwrap();
        assert_eq!(health.attempts, 3);
        assert_eq!(health.failures, 2);
        assert_eq!(health.successes, 1);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_retried() {
        let supervisor = Supervisor::new("c-1").with_default_strategy(fast_strategy(2, 10));
        let calls = AtomicUsize::new(0);

        let result = supervisor
            .execute_with_supervision("build", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        panic!("worker crashed");
                    }
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let health = supervisor.stage_health("build").unwrap();
        assert_eq!(health.failures, 1);
        assert_eq!(health.successes, 1);
        assert!(health.last_error.unwrap().contains("worker crashed"));
    }

    #[tokio::test]
    async fn test_panics_exhaust_retries_like_errors() {
        let supervisor = Supervisor::new("c-1").with_default_strategy(fast_strategy(1, 10));
        let err = supervisor
            .execute_with_supervision("build", |_| async {
                if true {
                    panic!("always");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let supervisor = Supervisor::new("c-1").with_default_strategy(fast_strategy(1, 10));
        let err = supervisor
            .execute_with_supervision("build", |_| async { Err::<(), _>(anyhow!("always")) })
            .await
            .unwrap_err();

        match err {
            StageError::RetriesExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "always");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_invoking() {
        let supervisor = Supervisor::new("c-1").with_default_strategy(fast_strategy(0, 2));
        let calls = AtomicUsize::new(0);
        let failing = |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow!("down")) }
        };

        for _ in 0..2 {
            supervisor
                .execute_with_supervision("deploy", failing)
                .await
                .unwrap_err();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = supervisor
            .execute_with_supervision("deploy", failing)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::CircuitOpen { consecutive_failures: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let report = supervisor.get_statistics();
        assert_eq!(report.open_circuits, vec!["deploy".to_string()]);
        assert!(!report.is_healthy());

        assert!(supervisor.reset_circuit("deploy"));
        supervisor
            .execute_with_supervision("deploy", |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(supervisor.get_statistics().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_timeout() {
        let strategy = fast_strategy(0, 10).with_timeout(1.0);
        let supervisor = Supervisor::new("c-1").with_default_strategy(strategy);

        let err = supervisor
            .execute_with_supervision("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Timeout { attempts: 1, .. }));
        assert_eq!(supervisor.stage_health("slow").unwrap().timeouts, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries_not_the_running_attempt() {
        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new("c-1")
            .with_default_strategy(fast_strategy(5, 10))
            .with_cancellation(cancel.clone());
        let calls = AtomicUsize::new(0);

        let err = supervisor
            .execute_with_supervision("build", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    Err::<(), _>(anyhow!("failing while cancelled"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registered_strategy_wins_over_default() {
        let mut supervisor = Supervisor::new("c-1").with_default_strategy(fast_strategy(0, 10));
        supervisor.register_strategy("flaky", fast_strategy(4, 10)).unwrap();
        assert_eq!(supervisor.strategy_for("flaky").max_retries, 4);
        assert_eq!(supervisor.strategy_for("other").max_retries, 0);
    }

    #[tokio::test]
    async fn test_invalid_strategies_never_time_out_instantly() {
        let mut supervisor =
            Supervisor::new("c-1").with_default_strategy(fast_strategy(0, 10).with_timeout(0.0));
        let err = supervisor
            .register_strategy("build", fast_strategy(0, 10).with_timeout(f64::INFINITY))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStrategy { ref stage, .. } if stage == "build"));
        assert_eq!(supervisor.strategy_for("build").max_retries, 0);

        let value = supervisor
            .execute_with_supervision("build", |_| async {
                tokio::task::yield_now().await;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_recovery_runs_between_attempts() {
        let engine = Arc::new(WorkflowEngine::with_builtins().unwrap());
        let mut machine = PipelineStateMachine::new("c-1", engine).unwrap();
        machine.transition(PipelineState::Initializing, "start", None);
        machine.transition(PipelineState::Running, "start", None);
        machine.push_state(PipelineState::Running, BTreeMap::new());
        let shared: SharedMachine = Arc::new(Mutex::new(machine));
        let store = Arc::new(MemoryStore::new());

        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new("c-1")
            .with_default_strategy(fast_strategy(1, 10))
            .with_state_machine(Arc::clone(&shared))
            .with_store(store.clone())
            .with_working_dir(dir.path())
            .with_state_dir(dir.path().join("state"));

        supervisor
            .execute_with_supervision("analysis", |attempt| async move {
                if attempt == 1 {
                    Err(anyhow!("request timed out"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let m = shared.lock().unwrap();
        assert_eq!(m.issues().len(), 1);
        assert_eq!(m.issues()[0].issue, IssueType::Timeout);
        assert_eq!(m.issues()[0].resolved, Some(true));
        // recovery frames unwound back to the pipeline frame
        assert_eq!(m.stack_depth(), 1);
        drop(m);

        let record = store.load_record("c-1").unwrap().unwrap();
        assert_eq!(record.health.unwrap().stages["analysis"].attempts, 2);
    }

    #[test]
    fn test_track_llm_call_without_tracker_is_free() {
        let supervisor = Supervisor::new("c-1");
        let record = supervisor
            .track_llm_call("gpt-4o", "openai", 1000, 1000, "review", "critique")
            .unwrap();
        assert_eq!(record.cost, 0.0);
    }

    #[test]
    fn test_track_llm_call_enforces_budget() {
        let config = CostConfig {
            daily_budget: Some(0.001),
            ..CostConfig::default()
        };
        let supervisor =
            Supervisor::new("c-1").with_cost_tracking(Arc::new(CostTracker::new(config)));
        let err = supervisor
            .track_llm_call("gpt-4o", "openai", 10_000, 10_000, "review", "critique")
            .unwrap_err();
        assert!(err.spent > err.limit);
        assert_eq!(supervisor.get_statistics().cost.unwrap().calls, 1);
    }

    #[test]
    fn test_check_budget_refuses_and_persists_ledger() {
        let config = CostConfig {
            daily_budget: Some(0.001),
            ..CostConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let supervisor = Supervisor::new("c-1")
            .with_cost_tracking(Arc::new(CostTracker::new(config)))
            .with_store(store.clone());
        assert!(supervisor.check_budget().is_ok());

        let _ = supervisor.track_llm_call("gpt-4o", "openai", 10_000, 10_000, "review", "critique");
        assert_eq!(store.load_cost_ledger().unwrap().unwrap().calls, 1);

        assert!(supervisor.check_budget().is_err());
        let ledger = store.load_cost_ledger().unwrap().unwrap();
        assert_eq!(ledger.calls, 1);
        assert_eq!(ledger.rejected_calls, 1);
        assert!(Supervisor::new("c-2").check_budget().is_ok());
    }

    #[tokio::test]
    async fn test_sandbox_disabled_is_an_error() {
        let supervisor = Supervisor::new("c-1");
        assert!(supervisor.execute_code_safely("print(1)", true).await.is_err());
    }

    #[test]
    fn test_restore_health_reopens_circuits() {
        let supervisor = Supervisor::new("c-1");
        let mut stages = BTreeMap::new();
        stages.insert(
            "deploy".to_string(),
            StageHealth {
                attempts: 5,
                failures: 5,
                consecutive_failures: 5,
                circuit_open: true,
                circuit_state: CircuitState::Open,
                ..StageHealth::default()
            },
        );
        supervisor.restore_health(&HealthReport::new("c-1", stages, None, None));

        let health = supervisor.stage_health("deploy").unwrap();
        assert!(health.circuit_open);
        assert_eq!(health.attempts, 5);
    }
}
