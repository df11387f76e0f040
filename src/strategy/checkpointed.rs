use super::sequential::run_in_order;
use super::{ExecutionStrategy, RunContext, Stage, StrategyOutcome};
use crate::errors::{ConfigError, PipelineError};
use async_trait::async_trait;
use std::sync::Arc;

/// Ordered run that reuses stages completed before a restart.
///
/// Completed stages are announced with a `StageRestored` event and their
/// cached result is handed to later stages as if they had just run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointResumeStrategy;

#[async_trait]
impl ExecutionStrategy for CheckpointResumeStrategy {
    fn name(&self) -> &'static str {
        "checkpoint_resume"
    }

    async fn execute(
        &self,
        stages: &[Arc<dyn Stage>],
        ctx: &RunContext,
    ) -> Result<StrategyOutcome, PipelineError> {
        if ctx.checkpoint.is_none() {
            return Err(ConfigError::InvalidStageGraph {
                stage: stages.first().map(|s| s.name().to_string()).unwrap_or_default(),
                message: "checkpoint resume requires a checkpoint".to_string(),
            }
            .into());
        }
        run_in_order(stages, ctx, false, true).await
    }
}
