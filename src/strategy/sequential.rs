use super::{
    ExecutionStrategy, RunContext, RunStatus, Stage, StageRun, StrategyOutcome, run_stage,
    validate_unique,
};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Stages in list order; the first failure ends the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialStrategy {
    skip_optional: bool,
    restore: bool,
}

impl SequentialStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequential, but stages in the context's optional set are skipped.
    pub fn fast() -> Self {
        Self {
            skip_optional: true,
            restore: false,
        }
    }

    /// Reuse stages the checkpoint already holds as completed.
    pub fn restoring(mut self) -> Self {
        self.restore = true;
        self
    }
}

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    fn name(&self) -> &'static str {
        if self.skip_optional {
            "fast"
        } else {
            "sequential"
        }
    }

    async fn execute(
        &self,
        stages: &[Arc<dyn Stage>],
        ctx: &RunContext,
    ) -> Result<StrategyOutcome, PipelineError> {
        run_in_order(stages, ctx, self.skip_optional, self.restore).await
    }
}

/// Shared loop for the ordered strategies. With `restore`, stages the
/// checkpoint already holds as completed are not re-run.
pub(crate) async fn run_in_order(
    stages: &[Arc<dyn Stage>],
    ctx: &RunContext,
    skip_optional: bool,
    restore: bool,
) -> Result<StrategyOutcome, PipelineError> {
    validate_unique(stages)?;
    let timer = Instant::now();
    let mut outcome = StrategyOutcome::empty();

    for stage in stages {
        let name = stage.name();
        if ctx.cancel.is_cancelled() {
            info!(card_id = %ctx.card_id, next_stage = name, "Run cancelled");
            outcome.status = RunStatus::Cancelled;
            break;
        }

        if restore && let Some(result) = ctx.restored_result(name).await {
            debug!(card_id = %ctx.card_id, stage = name, "Restored completed stage");
            ctx.restore_stage(name);
            outcome.results.insert(name.to_string(), result);
            outcome.stages_completed.push(name.to_string());
            continue;
        }

        if skip_optional && ctx.optional_stages.contains(name) {
            ctx.skip_stage(name, "optional stage skipped").await;
            outcome.stages_skipped.push(name.to_string());
            continue;
        }

        match run_stage(Arc::clone(stage), ctx, outcome.results.clone()).await {
            StageRun::Completed(result) => {
                outcome.results.insert(name.to_string(), result);
                outcome.stages_completed.push(name.to_string());
            }
            StageRun::Failed { error, attempts } => {
                outcome.record_failure(name, error, attempts);
                break;
            }
            StageRun::Cancelled => {
                outcome.status = RunStatus::Cancelled;
                break;
            }
        }
    }

    outcome.duration_seconds = timer.elapsed().as_secs_f64();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{context, counting_stage, failing_stage, ok_stage, with_checkpoint};
    use pipewright_common::StageState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_all_stages_in_order() {
        let (ctx, recorder) = context("c-1");
        let stages = vec![ok_stage("a"), ok_stage("b"), ok_stage("c")];

        let outcome = SequentialStrategy::new().execute(&stages, &ctx).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.stages_completed, vec!["a", "b", "c"]);
        assert_eq!(outcome.results["b"]["stage"], "b");
        assert_eq!(recorder.stages_with("stage_completed"), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let (ctx, recorder) = context("c-1");
        let (ctx, checkpoint) = with_checkpoint(ctx, 3);
        let after = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            ok_stage("a"),
            failing_stage("b"),
            counting_stage("c", Arc::clone(&after)),
        ];

        let outcome = SequentialStrategy::new().execute(&stages, &ctx).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_stage.as_deref(), Some("b"));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.stages_with("stage_failed"), vec!["b"]);

        let manager = checkpoint.lock().await;
        let cp = manager.checkpoint().unwrap();
        assert_eq!(cp.completed_stages, vec!["a"]);
        assert_eq!(cp.stages["b"].status, StageState::Failed);
        assert!(cp.stages["b"].error.as_deref().unwrap().contains("stage exploded"));
    }

    #[tokio::test]
    async fn test_fast_skips_optional_stages() {
        let (ctx, recorder) = context("c-1");
        let ctx = ctx.with_optional_stages(["b"]);
        let skipped = Arc::new(AtomicUsize::new(0));
        let stages = vec![ok_stage("a"), counting_stage("b", Arc::clone(&skipped)), ok_stage("c")];

        let outcome = SequentialStrategy::fast().execute(&stages, &ctx).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stages_completed, vec!["a", "c"]);
        assert_eq!(outcome.stages_skipped, vec!["b"]);
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.stages_with("stage_skipped"), vec!["b"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let (ctx, recorder) = context("c-1");
        ctx.cancel.cancel();
        let outcome = SequentialStrategy::new()
            .execute(&[ok_stage("a")], &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.stages_completed.is_empty());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_previous_results_flow_forward() {
        let (ctx, _) = context("c-1");
        let reader: Arc<dyn Stage> = Arc::new(super::super::FnStage::new("b", |input| async move {
            Ok(input.previous_results["a"].clone())
        }));
        let outcome = SequentialStrategy::new()
            .execute(&[ok_stage("a"), reader], &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.results["b"]["stage"], "a");
    }
}
