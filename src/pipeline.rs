//! Per-card pipeline runner.
//!
//! [`PipelineRunner::run`] wires the subsystems together for one card: it
//! plans the card, rebuilds the state machine and checkpoint from the
//! record store, runs the chosen strategy under a supervisor, and settles
//! the final state. Runs for the same card are serialized by a per-card
//! lock; different cards never contend.
//!
//! A cancelled run leaves the machine PAUSED and the checkpoint resumable.
//! [`PipelineRunner::abandon`] is the way to CANCELLED.
//!
//! Budgets span runs: every run on a runner charges one cost tracker, seeded
//! from the ledger in the store, so a new runner picks up today's spend.

use crate::arbiter::Arbiter;
use crate::checkpoint::{CheckpointManager, Progress};
use crate::collab::BoardStore;
use crate::config::PipewrightConfig;
use crate::errors::PipelineError;
use crate::events::{EventBus, PipelineEvent, PipelineObserver, StateTracker};
use crate::planner::{WorkflowPlan, create_workflow_plan};
use crate::state::{PipelineStateMachine, SharedMachine, is_valid_transition};
use crate::store::{FileStore, PipelineStore};
use crate::strategy::{
    CheckpointResumeStrategy, ExecutionStrategy, RunContext, RunStatus, SequentialStrategy, Stage,
    StrategyKind, StrategyOutcome,
};
use crate::supervisor::{CostTracker, CostTracking, HealthReport, Supervisor};
use crate::workflow::WorkflowEngine;
use dashmap::DashMap;
use pipewright_common::{Card, PipelineState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Board columns the runner moves a card through.
pub mod columns {
    pub const IN_PROGRESS: &str = "in_progress";
    pub const DONE: &str = "done";
    pub const BLOCKED: &str = "blocked";
    pub const READY: &str = "ready";
}

/// What an operator needs to decide between resuming and abandoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub stage: String,
    pub attempts: u32,
    pub error: String,
    /// Last stage recorded as completed before the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub card_id: String,
    pub strategy: StrategyKind,
    pub resumed: bool,
    pub plan: WorkflowPlan,
    pub outcome: StrategyOutcome,
    pub progress: Progress,
    pub health: HealthReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

impl PipelineReport {
    pub fn status(&self) -> RunStatus {
        self.outcome.status
    }
}

/// Removes a run's cancellation token when the run ends or is dropped.
struct ActiveRun<'a> {
    active: &'a DashMap<String, CancellationToken>,
    card_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.card_id);
    }
}

pub struct PipelineRunner {
    config: PipewrightConfig,
    store: Arc<dyn PipelineStore>,
    workflows: Arc<WorkflowEngine>,
    board: Option<Arc<dyn BoardStore>>,
    observers: Vec<Arc<dyn PipelineObserver>>,
    cost: Option<Arc<dyn CostTracking>>,
    arbiter: Arc<Arbiter>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active: DashMap<String, CancellationToken>,
}

impl PipelineRunner {
    /// Runner backed by a [`FileStore`] in the configured state directory.
    pub fn new(config: PipewrightConfig) -> Result<Self, PipelineError> {
        let store: Arc<dyn PipelineStore> = Arc::new(FileStore::new(config.state_dir()));
        Self::with_store(config, store)
    }

    /// Fails if the built-in workflow catalog does not cover every issue type.
    pub fn with_store(
        config: PipewrightConfig,
        store: Arc<dyn PipelineStore>,
    ) -> Result<Self, PipelineError> {
        let workflows = Arc::new(WorkflowEngine::with_builtins()?);
        workflows.validate_coverage()?;
        let cost = config.toml.cost.enabled.then(|| {
            let tracker: Arc<dyn CostTracking> =
                Arc::new(CostTracker::new(config.toml.cost.clone()));
            match store.load_cost_ledger() {
                Ok(Some(ledger)) => tracker.restore(&ledger),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to load cost ledger; starting from zero"),
            }
            tracker
        });
        let arbiter = Arc::new(Arbiter::new(config.toml.arbitration.clone()));
        Ok(Self {
            config,
            store,
            workflows,
            board: None,
            observers: Vec::new(),
            cost,
            arbiter,
            locks: DashMap::new(),
            active: DashMap::new(),
        })
    }

    pub fn with_board(mut self, board: Arc<dyn BoardStore>) -> Self {
        self.board = Some(board);
        self
    }

    /// Charge every run to `tracker` instead of the configured one.
    pub fn with_cost_tracking(mut self, tracker: Arc<dyn CostTracking>) -> Self {
        self.cost = Some(tracker);
        self
    }

    /// Subscribe `observer` to every run's event bus.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn store(&self) -> Arc<dyn PipelineStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &PipewrightConfig {
        &self.config
    }

    fn card_lock(&self, card_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(card_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ask a running pipeline to stop issuing stages. False if the card is
    /// not running.
    pub fn cancel(&self, card_id: &str) -> bool {
        match self.active.get(card_id) {
            Some(token) => {
                info!(card_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, card_id: &str) -> bool {
        self.active.contains_key(card_id)
    }

    /// Cards with an unfinished pipeline in the store.
    pub fn resumable_cards(&self) -> Result<Vec<String>, PipelineError> {
        self.store
            .get_resumable_pipelines()
            .map_err(PipelineError::Store)
    }

    /// Move a stopped pipeline to CANCELLED. It will not resume again until
    /// its record is cleared. False if the machine cannot reach CANCELLED
    /// from its current state.
    pub async fn abandon(&self, card_id: &str) -> Result<bool, PipelineError> {
        let lock = self.card_lock(card_id);
        let _guard = lock.lock().await;
        let mut machine = PipelineStateMachine::restore(
            card_id,
            Arc::clone(&self.workflows),
            Arc::clone(&self.store),
        )?;
        let abandoned = settle(&mut machine, PipelineState::Cancelled, "abandon", None);
        if abandoned {
            info!(card_id, "Pipeline abandoned");
        }
        Ok(abandoned)
    }

    /// Delete the card's record.
    pub async fn clear(&self, card_id: &str) -> Result<(), PipelineError> {
        let lock = self.card_lock(card_id);
        let _guard = lock.lock().await;
        self.store.clear(card_id).map_err(PipelineError::Store)
    }

    /// Run (or resume) the card's pipeline.
    ///
    /// A card with a resumable checkpoint picks up where it stopped:
    /// completed stages are restored rather than re-run. A card whose
    /// checkpoint is already COMPLETED is reported without running anything.
    #[tracing::instrument(skip_all, fields(card_id = %card.id, strategy = %kind))]
    pub async fn run(
        &self,
        card: &Card,
        stages: Vec<Arc<dyn Stage>>,
        kind: StrategyKind,
    ) -> Result<PipelineReport, PipelineError> {
        let card_id = card.id.as_str();
        let lock = self.card_lock(card_id);
        let _guard = lock.lock().await;

        let cancel = CancellationToken::new();
        self.active.insert(card_id.to_string(), cancel.clone());
        let _active = ActiveRun {
            active: &self.active,
            card_id: card_id.to_string(),
        };

        let plan = create_workflow_plan(card);
        info!(
            task_type = %plan.task_type,
            complexity = %plan.complexity,
            stages = stages.len(),
            "Planned card"
        );

        let mut machine = PipelineStateMachine::restore(
            card_id,
            Arc::clone(&self.workflows),
            Arc::clone(&self.store),
        )?;
        if machine.current_state() == PipelineState::Cancelled {
            return Err(PipelineError::Abandoned {
                card_id: card_id.to_string(),
            });
        }

        let previous_health = self
            .store
            .load_record(card_id)
            .map_err(PipelineError::Store)?
            .and_then(|record| record.health);

        let mut checkpoint = CheckpointManager::new(card_id, Arc::clone(&self.store));
        let resumed = checkpoint.resume()?.is_some();
        if !resumed && checkpoint.checkpoint().is_some() {
            info!("Pipeline already completed");
            return Ok(self.completed_report(card_id, kind, plan, &checkpoint, previous_health));
        }
        if !resumed {
            checkpoint.create_checkpoint(stages.len())?;
        }

        let event = if resumed { "resume" } else { "start" };
        if !settle(&mut machine, PipelineState::Running, event, None) {
            warn!(
                state = %machine.current_state(),
                "Persisted machine cannot reach RUNNING; starting a fresh one"
            );
            machine = PipelineStateMachine::new(card_id, Arc::clone(&self.workflows))?
                .with_store(Arc::clone(&self.store));
            settle(&mut machine, PipelineState::Running, event, None);
        }
        // frames left by an interrupted run are discarded
        if !machine.rollback_to_state(PipelineState::Running) {
            let metadata = BTreeMap::from([("strategy".to_string(), kind.to_string())]);
            machine.push_state(PipelineState::Running, metadata);
        }

        let machine: SharedMachine = Arc::new(Mutex::new(machine));
        let mut supervisor = Supervisor::from_config(card_id, &self.config)
            .with_state_machine(Arc::clone(&machine))
            .with_store(Arc::clone(&self.store))
            .with_cancellation(cancel.clone());
        if let Some(cost) = &self.cost {
            supervisor = supervisor.with_cost_tracking(Arc::clone(cost));
        }
        if let Some(health) = &previous_health {
            supervisor.restore_health(health);
        }
        let supervisor = Arc::new(supervisor);

        let events = Arc::new(EventBus::new());
        events.subscribe(Arc::new(StateTracker::new(Arc::clone(&machine))));
        for observer in &self.observers {
            events.subscribe(Arc::clone(observer));
        }

        let checkpoint = Arc::new(tokio::sync::Mutex::new(checkpoint));
        let mut ctx = RunContext::new(card_id, Arc::clone(&supervisor), Arc::clone(&events))
            .with_checkpoint(Arc::clone(&checkpoint))
            .with_max_parallel(self.config.max_parallel())
            .with_cancel(cancel)
            .with_arbiter(Arc::clone(&self.arbiter))
            .with_parallel_developers(plan.parallel_developers);
        if kind == StrategyKind::Fast {
            ctx = ctx.with_optional_stages(plan.skip_stages.iter().cloned());
        }

        self.move_card(card_id, columns::IN_PROGRESS).await;
        events.emit(PipelineEvent::PipelineStarted {
            card_id: card_id.to_string(),
            total_stages: stages.len(),
            resumed,
        });

        let strategy = strategy_for(kind, resumed);
        info!(strategy = strategy.name(), resumed, "Running pipeline");
        let outcome = match strategy.execute(&stages, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Pipeline rejected before any stage ran");
                let message = e.to_string();
                with_machine(&machine, |m| {
                    settle(m, PipelineState::Failed, "rejected", Some(&message))
                })?;
                events.emit(PipelineEvent::PipelineFinished {
                    card_id: card_id.to_string(),
                    status: RunStatus::Failed,
                });
                return Err(e);
            }
        };

        let mut checkpoint = checkpoint.lock().await;
        let (target, column) = match outcome.status {
            RunStatus::Completed => {
                checkpoint.mark_completed()?;
                (PipelineState::Completed, columns::DONE)
            }
            RunStatus::Failed => {
                let stage = outcome.failed_stage.clone().unwrap_or_default();
                checkpoint.mark_failed(&stage, outcome.error.as_deref().unwrap_or_default())?;
                (PipelineState::Failed, columns::BLOCKED)
            }
            RunStatus::Cancelled => {
                checkpoint.pause()?;
                (PipelineState::Paused, columns::READY)
            }
        };
        with_machine(&machine, |m| {
            let settled = settle(m, target, outcome.status.to_string().as_str(), outcome.error.as_deref());
            if m.rollback_to_state(PipelineState::Running) {
                m.pop_state();
            }
            settled
        })?;
        events.emit(PipelineEvent::PipelineFinished {
            card_id: card_id.to_string(),
            status: outcome.status,
        });
        self.move_card(card_id, column).await;

        let health = supervisor.get_statistics();
        if let Err(e) = self.store.save_health(card_id, &health) {
            warn!(error = %e, "Failed to persist final health report");
        }
        let failure = outcome.failed_stage.as_ref().map(|stage| FailureReport {
            stage: stage.clone(),
            attempts: outcome.attempts,
            error: outcome.error.clone().unwrap_or_default(),
            last_checkpoint: checkpoint
                .checkpoint()
                .and_then(|c| c.last_completed_stage())
                .map(str::to_string),
        });
        let progress = checkpoint.get_progress();

        match &failure {
            Some(f) => warn!(
                stage = %f.stage,
                attempts = f.attempts,
                error = %f.error,
                last_checkpoint = ?f.last_checkpoint,
                "Pipeline failed"
            ),
            None => info!(
                status = %outcome.status,
                stages_completed = progress.stages_completed,
                total_stages = progress.total_stages,
                duration_seconds = outcome.duration_seconds,
                "Pipeline finished"
            ),
        }

        Ok(PipelineReport {
            card_id: card_id.to_string(),
            strategy: kind,
            resumed,
            plan,
            outcome,
            progress,
            health,
            failure,
        })
    }

    fn completed_report(
        &self,
        card_id: &str,
        kind: StrategyKind,
        plan: WorkflowPlan,
        checkpoint: &CheckpointManager,
        health: Option<HealthReport>,
    ) -> PipelineReport {
        let mut outcome = StrategyOutcome::empty();
        if let Some(cp) = checkpoint.checkpoint() {
            outcome.stages_completed = cp.completed_stages.clone();
            outcome.results = cp
                .stages
                .iter()
                .filter_map(|(name, stage)| stage.result.clone().map(|r| (name.clone(), r)))
                .collect();
        }
        PipelineReport {
            card_id: card_id.to_string(),
            strategy: kind,
            resumed: false,
            plan,
            outcome,
            progress: checkpoint.get_progress(),
            health: health
                .unwrap_or_else(|| HealthReport::new(card_id, BTreeMap::new(), None, None)),
            failure: None,
        }
    }

    async fn move_card(&self, card_id: &str, column: &str) {
        if let Some(board) = &self.board
            && let Err(e) = board.move_card(card_id, column).await
        {
            warn!(card_id, column, error = %e, "Failed to move card on board");
        }
    }
}

/// Strategy for a run. Resumed ordered runs restore completed stages; the
/// parallel strategy always does.
fn strategy_for(kind: StrategyKind, resumed: bool) -> Box<dyn ExecutionStrategy> {
    match (kind, resumed) {
        (StrategyKind::Sequential, true) => Box::new(CheckpointResumeStrategy),
        (StrategyKind::Fast, true) => Box::new(SequentialStrategy::fast().restoring()),
        (kind, _) => kind.build(),
    }
}

fn with_machine<R>(
    machine: &SharedMachine,
    f: impl FnOnce(&mut PipelineStateMachine) -> R,
) -> Result<R, PipelineError> {
    let mut guard = machine.lock().map_err(|_| PipelineError::LockPoisoned)?;
    Ok(f(&mut guard))
}

/// Pipeline-level states the runner may route through, most preferred first.
const ROUTE_ORDER: [PipelineState; 8] = [
    PipelineState::Running,
    PipelineState::Recovering,
    PipelineState::Initializing,
    PipelineState::Paused,
    PipelineState::Failed,
    PipelineState::Completed,
    PipelineState::Cancelled,
    PipelineState::Idle,
];

/// Shortest chain of allowed transitions from `from` to `to`, never passing
/// through a stage-level state.
fn route(from: PipelineState, to: PipelineState) -> Option<Vec<PipelineState>> {
    let mut previous: HashMap<PipelineState, PipelineState> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    while let Some(state) = queue.pop_front() {
        if state == to {
            let mut path = vec![to];
            let mut cursor = to;
            while let Some(&before) = previous.get(&cursor) {
                if before == from {
                    break;
                }
                path.push(before);
                cursor = before;
            }
            path.reverse();
            return Some(path);
        }
        for next in ROUTE_ORDER {
            if next != from && !previous.contains_key(&next) && is_valid_transition(state, next) {
                previous.insert(next, state);
                queue.push_back(next);
            }
        }
    }
    None
}

/// Walk the machine to `target`. False, with the machine untouched, if no
/// route exists.
fn settle(
    machine: &mut PipelineStateMachine,
    target: PipelineState,
    event: &str,
    reason: Option<&str>,
) -> bool {
    let from = machine.current_state();
    if from == target {
        return true;
    }
    let Some(path) = route(from, target) else {
        return false;
    };
    path.into_iter()
        .all(|state| machine.transition(state, event, reason))
}
