//! Dependency-driven parallel execution.
//!
//! A stage is issued once every stage it depends on has completed. At most
//! `max_parallel` stages execute at once. A failed stage does not stop its
//! running siblings; its dependents, direct and transitive, are skipped.

use super::{
    ExecutionStrategy, RunContext, RunStatus, Stage, StageRun, StrategyOutcome, run_stage,
    validate_unique,
};
use crate::errors::{ConfigError, PipelineError};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelStrategy;

/// Group stages into waves: every stage's dependencies sit in earlier waves.
/// Fails on unknown dependencies and cycles.
pub fn compute_waves(stages: &[Arc<dyn Stage>]) -> Result<Vec<Vec<String>>, ConfigError> {
    validate_unique(stages)?;
    let names: HashSet<&str> = stages.iter().map(|s| s.name()).collect();
    let mut indegree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for stage in stages {
        let deps = stage.depends_on();
        for dep in &deps {
            if !names.contains(dep.as_str()) {
                return Err(ConfigError::InvalidStageGraph {
                    stage: stage.name().to_string(),
                    message: format!("depends on unknown stage '{}'", dep),
                });
            }
            dependents
                .entry(dep.clone())
                .or_default()
                .push(stage.name().to_string());
        }
        indegree.insert(stage.name().to_string(), deps.len());
    }

    let mut waves = Vec::new();
    let mut current: Vec<String> = stages
        .iter()
        .map(|s| s.name().to_string())
        .filter(|n| indegree[n] == 0)
        .collect();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for name in &current {
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(dependent.clone());
                    }
                }
            }
        }
        waves.push(std::mem::take(&mut current));
        current = next;
    }

    if placed < stages.len() {
        let stuck = stages
            .iter()
            .map(|s| s.name())
            .find(|n| indegree.get(*n).copied().unwrap_or(0) > 0)
            .unwrap_or_default();
        return Err(ConfigError::InvalidStageGraph {
            stage: stuck.to_string(),
            message: "dependency cycle".to_string(),
        });
    }
    Ok(waves)
}

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn execute(
        &self,
        stages: &[Arc<dyn Stage>],
        ctx: &RunContext,
    ) -> Result<StrategyOutcome, PipelineError> {
        let waves = compute_waves(stages)?;
        info!(
            card_id = %ctx.card_id,
            stages = stages.len(),
            waves = waves.len(),
            max_parallel = ctx.max_parallel,
            "Starting parallel run"
        );

        let timer = Instant::now();
        let mut outcome = StrategyOutcome::empty();
        let deps: HashMap<String, Vec<String>> = stages
            .iter()
            .map(|s| (s.name().to_string(), s.depends_on()))
            .collect();

        let mut waiting: VecDeque<Arc<dyn Stage>> = VecDeque::new();
        for stage in stages {
            if let Some(result) = ctx.restored_result(stage.name()).await {
                ctx.restore_stage(stage.name());
                outcome.results.insert(stage.name().to_string(), result);
                outcome.stages_completed.push(stage.name().to_string());
            } else {
                waiting.push_back(Arc::clone(stage));
            }
        }

        let semaphore = Arc::new(Semaphore::new(ctx.max_parallel.max(1)));
        let mut running: JoinSet<(String, StageRun)> = JoinSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        loop {
            // skip everything downstream of a failure or skip
            let mut changed = true;
            while changed {
                changed = false;
                let mut keep = VecDeque::with_capacity(waiting.len());
                while let Some(stage) = waiting.pop_front() {
                    let failed_dep = deps[stage.name()].iter().find(|d| blocked.contains(*d));
                    match failed_dep {
                        Some(dep) => {
                            let reason = format!("dependency '{}' did not complete", dep);
                            ctx.skip_stage(stage.name(), &reason).await;
                            blocked.insert(stage.name().to_string());
                            outcome.stages_skipped.push(stage.name().to_string());
                            changed = true;
                        }
                        None => keep.push_back(stage),
                    }
                }
                waiting = keep;
            }

            if ctx.cancel.is_cancelled() {
                cancelled = true;
            } else {
                let mut keep = VecDeque::with_capacity(waiting.len());
                while let Some(stage) = waiting.pop_front() {
                    let ready = deps[stage.name()]
                        .iter()
                        .all(|d| outcome.results.contains_key(d));
                    if !ready {
                        keep.push_back(stage);
                        continue;
                    }
                    let name = stage.name().to_string();
                    let previous = outcome.results.clone();
                    let semaphore = Arc::clone(&semaphore);
                    let ctx = ctx.clone();
                    debug!(card_id = %ctx.card_id, stage = %name, "Issuing stage");
                    running.spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return (name, StageRun::Cancelled);
                        };
                        if ctx.cancel.is_cancelled() {
                            return (name, StageRun::Cancelled);
                        }
                        let run = AssertUnwindSafe(run_stage(stage, &ctx, previous))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| StageRun::Failed {
                                error: "stage panicked".to_string(),
                                attempts: 0,
                            });
                        (name, run)
                    });
                }
                waiting = keep;
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((name, StageRun::Completed(result))) => {
                    outcome.results.insert(name.clone(), result);
                    outcome.stages_completed.push(name);
                }
                Ok((name, StageRun::Failed { error, attempts })) => {
                    outcome.record_failure(&name, error, attempts);
                    blocked.insert(name);
                }
                Ok((_, StageRun::Cancelled)) => cancelled = true,
                Err(e) => error!(card_id = %ctx.card_id, error = %e, "Stage task aborted"),
            }
        }

        if outcome.status != RunStatus::Failed && (cancelled || !waiting.is_empty()) {
            outcome.status = RunStatus::Cancelled;
        }
        outcome.duration_seconds = timer.elapsed().as_secs_f64();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::FnStage;
    use crate::strategy::test_support::{context, failing_stage, ok_stage, with_checkpoint};
    use anyhow::anyhow;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn after(name: &str, deps: &[&str]) -> Arc<dyn Stage> {
        let owned = name.to_string();
        Arc::new(
            FnStage::new(name, move |input| {
                let owned = owned.clone();
                async move { Ok(json!({ "stage": owned, "saw": input.previous_results.len() })) }
            })
            .after(deps),
        )
    }

    #[test]
    fn test_compute_waves() {
        let stages = vec![
            ok_stage("a"),
            ok_stage("b"),
            after("c", &["a", "b"]),
            after("d", &["c"]),
        ];
        let waves = compute_waves(&stages).unwrap();
        assert_eq!(waves, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
    }

    #[test]
    fn test_cycle_and_unknown_dependency_rejected() {
        let cycle = vec![after("a", &["b"]), after("b", &["a"])];
        assert!(matches!(
            compute_waves(&cycle),
            Err(ConfigError::InvalidStageGraph { .. })
        ));
        let unknown = vec![after("a", &["ghost"])];
        let err = compute_waves(&unknown).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_independent_stages_all_complete() {
        let (ctx, recorder) = context("c-1");
        let ctx = ctx.with_max_parallel(2);
        let stages = vec![ok_stage("a"), ok_stage("b"), ok_stage("c"), after("d", &["a", "b", "c"])];

        let outcome = ParallelStrategy.execute(&stages, &ctx).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.stages_completed.len(), 4);
        assert_eq!(outcome.stages_completed.last().map(String::as_str), Some("d"));
        assert_eq!(outcome.results["d"]["saw"], 3);
        assert_eq!(recorder.stages_with("stage_completed").len(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (ctx, _) = context("c-1");
        let ctx = ctx.with_max_parallel(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let stages: Vec<Arc<dyn Stage>> = (0..6)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                Arc::new(FnStage::new(&format!("s{i}"), move |_| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                })) as Arc<dyn Stage>
            })
            .collect();

        let outcome = ParallelStrategy.execute(&stages, &ctx).await.unwrap();
        assert!(outcome.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let (ctx, recorder) = context("c-1");
        let (ctx, checkpoint) = with_checkpoint(ctx, 4);
        let slow_sibling: Arc<dyn Stage> = Arc::new(FnStage::new("sibling", |_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(json!("done"))
        }));
        let stages = vec![
            failing_stage("broken"),
            slow_sibling,
            after("child", &["broken"]),
            after("grandchild", &["child"]),
        ];

        let outcome = ParallelStrategy.execute(&stages, &ctx).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_stage.as_deref(), Some("broken"));
        assert_eq!(outcome.stages_completed, vec!["sibling"]);
        assert_eq!(outcome.stages_skipped, vec!["child", "grandchild"]);
        assert_eq!(recorder.stages_with("stage_skipped"), vec!["child", "grandchild"]);

        let manager = checkpoint.lock().await;
        assert_eq!(manager.checkpoint().unwrap().completed_stages, vec!["sibling"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_issuing() {
        let (ctx, _) = context("c-1");
        let ctx = ctx.with_max_parallel(1);
        let cancel = ctx.cancel.clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let first: Arc<dyn Stage> = Arc::new(FnStage::new("first", move |_| {
            let cancel = cancel.clone();
            async move {
                cancel.cancel();
                Err(anyhow!("interrupted"))
            }
        }));
        let counter = Arc::clone(&ran);
        let second: Arc<dyn Stage> = Arc::new(FnStage::new("second", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }));

        let outcome = ParallelStrategy
            .execute(&[first, second], &ctx)
            .await
            .unwrap();
        assert_ne!(outcome.status, RunStatus::Completed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
