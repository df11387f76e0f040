//! Execution strategies: how a card's stages are ordered and run.
//!
//! Every strategy runs each stage through the [`Supervisor`], records a
//! stage checkpoint before and after it, and publishes progress on the
//! [`EventBus`]. Cancellation stops new stages, and new attempts of a
//! running stage, from being issued. An attempt already executing runs to
//! completion; a stage cut short between attempts is left pending in the
//! checkpoint.
//!
//! - [`SequentialStrategy`] runs stages in order, stopping at the first failure.
//!   Its `fast` flavour skips stages marked optional.
//! - [`ParallelStrategy`] runs stages as soon as their dependencies complete,
//!   bounded by `max_parallel`. A failure does not cancel running siblings;
//!   only the failed stage's dependents are skipped.
//! - [`CheckpointResumeStrategy`] runs in order but restores stages completed
//!   in an earlier run from their cached results.

pub mod checkpointed;
pub mod parallel;
pub mod sequential;

pub use checkpointed::CheckpointResumeStrategy;
pub use parallel::ParallelStrategy;
pub use sequential::SequentialStrategy;

use crate::arbiter::Arbiter;
use crate::checkpoint::{CheckpointManager, StageCheckpointUpdate};
use crate::collab::{CompletionService, MeteredCompletion};
use crate::errors::{ConfigError, PipelineError, StageError};
use crate::events::{EventBus, PipelineEvent};
use crate::supervisor::Supervisor;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use pipewright_common::{ParseEnumError, StageState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Final status of a strategy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a stage sees when it runs.
#[derive(Clone)]
pub struct StageInput {
    pub card_id: String,
    pub stage: String,
    /// 1-based attempt number within the supervised sequence
    pub attempt: u32,
    /// Results of every stage completed before this one was issued
    pub previous_results: BTreeMap<String, Value>,
    /// Shared checkpoint, for stages that cache worker outputs
    pub checkpoint: Option<Arc<Mutex<CheckpointManager>>>,
    /// Supervisor running this stage: cost tracking and the code sandbox
    pub supervisor: Arc<Supervisor>,
    /// Configured arbiter for stages that pick between developer outputs
    pub arbiter: Arc<Arbiter>,
    /// Developers the plan allots to this card
    pub parallel_developers: u32,
}

impl StageInput {
    /// Wrap `inner` so every completion this stage issues is budget-checked
    /// and charged to the run's cost ledger.
    pub fn metered(&self, inner: Arc<dyn CompletionService>, provider: &str) -> MeteredCompletion {
        MeteredCompletion::new(inner, Arc::clone(&self.supervisor), provider, &self.stage)
    }
}

/// One unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Stages that must complete first. Only the parallel strategy reads this.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, input: &StageInput) -> Result<Value>;
}

/// Stage backed by an async closure.
pub struct FnStage<F> {
    name: String,
    depends_on: Vec<String>,
    run: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    pub fn new(name: &str, run: F) -> Self {
        Self {
            name: name.to_string(),
            depends_on: Vec::new(),
            run,
        }
    }

    pub fn after(mut self, dependencies: &[&str]) -> Self {
        self.depends_on = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    async fn execute(&self, input: &StageInput) -> Result<Value> {
        (self.run)(input.clone()).await
    }
}

/// Everything a strategy needs besides the stages themselves.
#[derive(Clone)]
pub struct RunContext {
    pub card_id: String,
    pub supervisor: Arc<Supervisor>,
    pub events: Arc<EventBus>,
    pub checkpoint: Option<Arc<Mutex<CheckpointManager>>>,
    /// Stages the fast strategy may skip
    pub optional_stages: HashSet<String>,
    pub max_parallel: usize,
    pub cancel: CancellationToken,
    pub arbiter: Arc<Arbiter>,
    pub parallel_developers: u32,
}

impl RunContext {
    pub fn new(card_id: &str, supervisor: Arc<Supervisor>, events: Arc<EventBus>) -> Self {
        Self {
            card_id: card_id.to_string(),
            supervisor,
            events,
            checkpoint: None,
            optional_stages: HashSet::new(),
            max_parallel: 4,
            cancel: CancellationToken::new(),
            arbiter: Arc::new(Arbiter::default()),
            parallel_developers: 1,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<Mutex<CheckpointManager>>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_optional_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_arbiter(mut self, arbiter: Arc<Arbiter>) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn with_parallel_developers(mut self, developers: u32) -> Self {
        self.parallel_developers = developers.max(1);
        self
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        self.events.emit(event);
    }

    pub(crate) async fn save_stage(
        &self,
        stage: &str,
        update: StageCheckpointUpdate,
    ) -> Result<(), PipelineError> {
        match &self.checkpoint {
            Some(checkpoint) => checkpoint.lock().await.save_stage_checkpoint(stage, update),
            None => Ok(()),
        }
    }

    /// Result of a stage completed in an earlier run, if any.
    pub(crate) async fn restored_result(&self, stage: &str) -> Option<Value> {
        let checkpoint = self.checkpoint.as_ref()?.lock().await;
        if !checkpoint.is_stage_completed(stage) {
            return None;
        }
        Some(checkpoint.stage_result(stage).unwrap_or(Value::Null))
    }

    pub(crate) async fn skip_stage(&self, stage: &str, reason: &str) {
        if let Err(e) = self
            .save_stage(stage, StageCheckpointUpdate::new(StageState::Skipped))
            .await
        {
            error!(card_id = %self.card_id, stage, error = %e, "Failed to checkpoint skipped stage");
        }
        self.emit(PipelineEvent::StageSkipped {
            card_id: self.card_id.clone(),
            stage: stage.to_string(),
            reason: reason.to_string(),
        });
    }

    pub(crate) fn restore_stage(&self, stage: &str) {
        self.emit(PipelineEvent::StageRestored {
            card_id: self.card_id.clone(),
            stage: stage.to_string(),
        });
    }
}

/// Result of running a list of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub status: RunStatus,
    /// Completed or restored stages, in completion order
    pub stages_completed: Vec<String>,
    #[serde(default)]
    pub stages_skipped: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made by the failed stage
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    pub duration_seconds: f64,
}

impl StrategyOutcome {
    pub(crate) fn empty() -> Self {
        Self {
            status: RunStatus::Completed,
            stages_completed: Vec::new(),
            stages_skipped: Vec::new(),
            failed_stage: None,
            error: None,
            attempts: 0,
            results: BTreeMap::new(),
            duration_seconds: 0.0,
        }
    }

    pub(crate) fn record_failure(&mut self, stage: &str, error: String, attempts: u32) {
        self.status = RunStatus::Failed;
        if self.failed_stage.is_none() {
            self.failed_stage = Some(stage.to_string());
            self.error = Some(error);
            self.attempts = attempts;
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        stages: &[Arc<dyn Stage>],
        ctx: &RunContext,
    ) -> Result<StrategyOutcome, PipelineError>;
}

/// Named strategies, as selected in configuration or by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Fast,
    Parallel,
    CheckpointResume,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Fast => "fast",
            Self::Parallel => "parallel",
            Self::CheckpointResume => "checkpoint_resume",
        }
    }

    pub fn build(self) -> Box<dyn ExecutionStrategy> {
        match self {
            Self::Sequential => Box::new(SequentialStrategy::new()),
            Self::Fast => Box::new(SequentialStrategy::fast()),
            Self::Parallel => Box::new(ParallelStrategy),
            Self::CheckpointResume => Box::new(CheckpointResumeStrategy),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "fast" => Ok(Self::Fast),
            "parallel" => Ok(Self::Parallel),
            "checkpoint_resume" | "resume" => Ok(Self::CheckpointResume),
            _ => Err(ParseEnumError::new("strategy", s)),
        }
    }
}

/// How a single stage run ended.
pub(crate) enum StageRun {
    Completed(Value),
    Failed { error: String, attempts: u32 },
    Cancelled,
}

/// Reject duplicate stage names.
pub(crate) fn validate_unique(stages: &[Arc<dyn Stage>]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage.name()) {
            return Err(ConfigError::InvalidStageGraph {
                stage: stage.name().to_string(),
                message: "duplicate stage name".to_string(),
            });
        }
    }
    Ok(())
}

/// Run one stage under supervision with checkpoints and events on both sides.
pub(crate) async fn run_stage(
    stage: Arc<dyn Stage>,
    ctx: &RunContext,
    previous: BTreeMap<String, Value>,
) -> StageRun {
    let name = stage.name().to_string();
    let started_at = Utc::now();
    let timer = Instant::now();

    if let Err(e) = ctx
        .save_stage(
            &name,
            StageCheckpointUpdate::new(StageState::Running).with_start_time(started_at),
        )
        .await
    {
        return fail_stage(ctx, &name, format!("checkpoint write failed: {e}"), 0).await;
    }
    ctx.emit(PipelineEvent::StageStarted {
        card_id: ctx.card_id.clone(),
        stage: name.clone(),
    });

    let supervised = ctx.supervisor.execute_with_supervision(&name, |attempt| {
        let stage = Arc::clone(&stage);
        let input = StageInput {
            card_id: ctx.card_id.clone(),
            stage: name.clone(),
            attempt,
            previous_results: previous.clone(),
            checkpoint: ctx.checkpoint.clone(),
            supervisor: Arc::clone(&ctx.supervisor),
            arbiter: Arc::clone(&ctx.arbiter),
            parallel_developers: ctx.parallel_developers,
        };
        async move { stage.execute(&input).await }
    });

    // in-flight attempts run to completion; cancellation only stops retries
    match supervised.await {
        Err(StageError::Cancelled { .. }) => {
            if let Err(e) = ctx
                .save_stage(&name, StageCheckpointUpdate::new(StageState::Pending))
                .await
            {
                error!(card_id = %ctx.card_id, stage = %name, error = %e, "Failed to checkpoint cancelled stage");
            }
            StageRun::Cancelled
        }
        Ok(value) => {
            let update = StageCheckpointUpdate::new(StageState::Completed)
                .with_result(value.clone())
                .with_times(started_at, Utc::now());
            if let Err(e) = ctx.save_stage(&name, update).await {
                return fail_stage(ctx, &name, format!("checkpoint write failed: {e}"), 0).await;
            }
            ctx.emit(PipelineEvent::StageCompleted {
                card_id: ctx.card_id.clone(),
                stage: name,
                duration_seconds: timer.elapsed().as_secs_f64(),
            });
            StageRun::Completed(value)
        }
        Err(e) => fail_stage(ctx, &name, e.to_string(), e.attempts()).await,
    }
}

async fn fail_stage(ctx: &RunContext, stage: &str, error: String, attempts: u32) -> StageRun {
    let update = StageCheckpointUpdate::new(StageState::Failed)
        .with_error(&error)
        .with_times(Utc::now(), Utc::now());
    if let Err(e) = ctx.save_stage(stage, update).await {
        error!(card_id = %ctx.card_id, stage, error = %e, "Failed to checkpoint stage failure");
    }
    ctx.emit(PipelineEvent::StageFailed {
        card_id: ctx.card_id.clone(),
        stage: stage.to_string(),
        error: error.clone(),
        attempts,
    });
    StageRun::Failed { error, attempts }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::events::EventRecorder;
    use crate::store::MemoryStore;
    use crate::supervisor::RecoveryStrategy;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn context(card_id: &str) -> (RunContext, Arc<EventRecorder>) {
        let supervisor = Supervisor::new(card_id).with_default_strategy(
            RecoveryStrategy::default()
                .with_max_retries(0)
                .with_retry_delay(0.0),
        );
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(EventRecorder::new());
        events.subscribe(recorder.clone());
        (
            RunContext::new(card_id, Arc::new(supervisor), events),
            recorder,
        )
    }

    pub fn with_checkpoint(ctx: RunContext, total: usize) -> (RunContext, Arc<Mutex<CheckpointManager>>) {
        let mut manager = CheckpointManager::new(&ctx.card_id, Arc::new(MemoryStore::new()));
        manager.create_checkpoint(total).unwrap();
        let manager = Arc::new(Mutex::new(manager));
        (ctx.with_checkpoint(Arc::clone(&manager)), manager)
    }

    pub fn ok_stage(name: &str) -> Arc<dyn Stage> {
        let owned = name.to_string();
        Arc::new(FnStage::new(name, move |_| {
            let owned = owned.clone();
            async move { Ok(json!({ "stage": owned })) }
        }))
    }

    pub fn failing_stage(name: &str) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name, |_| async { Err(anyhow!("stage exploded")) }))
    }

    pub fn counting_stage(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }))
    }
}
