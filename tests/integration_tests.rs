//! Integration tests for pipewright
//!
//! These tests drive the public API end to end: runner, strategies,
//! supervisor and the file-backed record store together.

use anyhow::{Result, anyhow};
use pipewright::{
    Card, FileStore, FnStage, PipelineRunner, PipelineState, PipelineStore, PipewrightConfig,
    PipewrightToml, RunStatus, Stage, StageError, StrategyKind, Supervisor,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Config rooted in `dir` with immediate, non-retrying stages.
fn quiet_config(dir: &TempDir) -> PipewrightConfig {
    let mut toml = PipewrightToml::default();
    toml.supervisor.default.max_retries = 0;
    toml.supervisor.default.retry_delay_seconds = 0.0;
    toml.cost.enabled = false;
    toml.sandbox.enabled = false;
    PipewrightConfig::from_toml(dir.path().to_path_buf(), toml)
}

fn counted_stage(name: &str, runs: Arc<AtomicUsize>) -> Arc<dyn Stage> {
    let label = name.to_string();
    Arc::new(FnStage::new(name, move |_input| {
        let runs = Arc::clone(&runs);
        let label = label.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "stage": label }))
        }
    }))
}

// =============================================================================
// Crash and resume
// =============================================================================

mod crash_resume {
    use super::*;

    struct Harness {
        runs: Vec<Arc<AtomicUsize>>,
        crash_armed: Arc<AtomicBool>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                runs: (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect(),
                crash_armed: Arc::new(AtomicBool::new(true)),
            }
        }

        /// Five stages; the third hangs while the crash is armed.
        fn stages(&self) -> Vec<Arc<dyn Stage>> {
            let mut stages = Vec::new();
            for (i, runs) in self.runs.iter().enumerate() {
                let name = format!("stage-{}", i + 1);
                if i == 2 {
                    let runs = Arc::clone(runs);
                    let armed = Arc::clone(&self.crash_armed);
                    let stage: Arc<dyn Stage> = Arc::new(FnStage::new(&name, move |_input| {
                        let runs = Arc::clone(&runs);
                        let armed = Arc::clone(&armed);
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            if armed.load(Ordering::SeqCst) {
                                std::future::pending::<()>().await;
                            }
                            Ok(json!({ "stage": "stage-3" }))
                        }
                    }));
                    stages.push(stage);
                } else {
                    stages.push(counted_stage(&name, Arc::clone(runs)));
                }
            }
            stages
        }

        fn count(&self, stage: usize) -> usize {
            self.runs[stage - 1].load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_crash_after_two_stages_resumes_remaining_three() {
        let dir = TempDir::new().unwrap();
        let config = quiet_config(&dir);
        let card = Card::new("card-42", "Implement audit export");
        let harness = Harness::new();

        // first process: dies while stage 3 is in flight
        {
            let runner = PipelineRunner::new(config.clone()).unwrap();
            let crashed = tokio::time::timeout(
                Duration::from_secs(1),
                runner.run(&card, harness.stages(), StrategyKind::Sequential),
            )
            .await;
            assert!(crashed.is_err(), "run should still be blocked in stage 3");
        }

        let store = FileStore::new(config.state_dir());
        let checkpoint = store.load_checkpoint("card-42").unwrap().unwrap();
        assert_eq!(checkpoint.stages_completed, 2);
        assert_eq!(checkpoint.completed_stages, vec!["stage-1", "stage-2"]);
        assert_eq!(store.get_resumable_pipelines().unwrap(), vec!["card-42"]);

        // second process: same state dir, crash disarmed
        harness.crash_armed.store(false, Ordering::SeqCst);
        let runner = PipelineRunner::new(config.clone()).unwrap();
        let report = runner
            .run(&card, harness.stages(), StrategyKind::Sequential)
            .await
            .unwrap();

        assert!(report.resumed);
        assert_eq!(report.status(), RunStatus::Completed);
        assert_eq!(report.progress.stages_completed, 5);
        assert_eq!(report.progress.progress_percent, 100.0);
        assert_eq!(report.outcome.results["stage-1"]["stage"], "stage-1");

        assert_eq!(harness.count(1), 1);
        assert_eq!(harness.count(2), 1);
        assert_eq!(harness.count(3), 2);
        assert_eq!(harness.count(4), 1);
        assert_eq!(harness.count(5), 1);

        let checkpoint = store.load_checkpoint("card-42").unwrap().unwrap();
        assert_eq!(checkpoint.status, pipewright::CheckpointStatus::Completed);
        assert_eq!(checkpoint.stages_completed, 5);
        assert_eq!(checkpoint.resume_count, 1);

        let machine = store.load_pipeline_state("card-42").unwrap().unwrap();
        assert_eq!(machine.current_state, PipelineState::Completed);
        assert_eq!(machine.stack.depth(), 0);
        assert!(store.get_resumable_pipelines().unwrap().is_empty());
    }
}

// =============================================================================
// Parallel batches
// =============================================================================

mod parallel_batch {
    use super::*;
    use tokio::sync::Barrier;

    fn after(name: &str, deps: &[&str], runs: Arc<AtomicUsize>) -> Arc<dyn Stage> {
        let label = name.to_string();
        Arc::new(
            FnStage::new(name, move |input| {
                let runs = Arc::clone(&runs);
                let label = label.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "stage": label, "saw": input.previous_results.len() }))
                }
            })
            .after(deps),
        )
    }

    #[tokio::test]
    async fn test_failure_skips_only_dependents() {
        let dir = TempDir::new().unwrap();
        let runner = PipelineRunner::new(quiet_config(&dir)).unwrap();
        let card = Card::new("card-7", "Build reporting service");
        let runs = Arc::new(AtomicUsize::new(0));

        // a and b must overlap to get past the barrier
        let barrier = Arc::new(Barrier::new(2));
        let meet = |name: &str| -> Arc<dyn Stage> {
            let barrier = Arc::clone(&barrier);
            let runs = Arc::clone(&runs);
            Arc::new(FnStage::new(name, move |_input| {
                let barrier = Arc::clone(&barrier);
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    barrier.wait().await;
                    Ok(Value::Null)
                }
            }))
        };
        let broken: Arc<dyn Stage> = Arc::new(FnStage::new("e", |_input| async {
            let result: Result<Value> = Err(anyhow!("integration database unreachable"));
            result
        }));

        let stages = vec![
            meet("a"),
            meet("b"),
            after("c", &["a", "b"], Arc::clone(&runs)),
            after("d", &["c"], Arc::clone(&runs)),
            broken,
            after("f", &["e"], Arc::clone(&runs)),
        ];

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(&card, stages, StrategyKind::Parallel),
        )
        .await
        .expect("independent stages should run concurrently")
        .unwrap();

        assert_eq!(report.status(), RunStatus::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.stage, "e");
        assert!(failure.error.contains("integration database unreachable"));

        let mut completed = report.outcome.stages_completed.clone();
        completed.sort();
        assert_eq!(completed, vec!["a", "b", "c", "d"]);
        assert_eq!(report.outcome.stages_skipped, vec!["f"]);
        assert_eq!(report.outcome.results["d"]["saw"], 3);
        // a, b, c, d ran; f never did
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_different_cards_run_independently() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(PipelineRunner::new(quiet_config(&dir)).unwrap());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let runner = Arc::clone(&runner);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                let card = Card::new(&format!("card-{i}"), "Add search filter");
                let stages = vec![
                    counted_stage("analysis", Arc::clone(&runs)),
                    counted_stage("development", Arc::clone(&runs)),
                ];
                runner.run(&card, stages, StrategyKind::Sequential).await
            }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.status(), RunStatus::Completed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 8);
        assert!(runner.resumable_cards().unwrap().is_empty());
    }
}

// =============================================================================
// Supervisor properties
// =============================================================================

mod supervisor_properties {
    use super::*;
    use pipewright::RecoveryStrategy;

    #[tokio::test]
    async fn test_retries_bound_invocations() {
        let supervisor = Supervisor::new("card-1").with_default_strategy(
            RecoveryStrategy::default()
                .with_max_retries(2)
                .with_retry_delay(0.0),
        );
        let calls = AtomicUsize::new(0);

        let result: Result<(), StageError> = supervisor
            .execute_with_supervision("development", |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("compiler crashed")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(StageError::RetriesExhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("compiler crashed"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_never_invokes_stage() {
        let supervisor = Supervisor::new("card-1").with_default_strategy(
            RecoveryStrategy::default()
                .with_max_retries(0)
                .with_retry_delay(0.0)
                .with_circuit_breaker_threshold(2),
        );
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let _: Result<(), StageError> = supervisor
                .execute_with_supervision("review", |_attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow!("reviewer unavailable")) }
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let result: Result<(), StageError> = supervisor
            .execute_with_supervision("review", |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(StageError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.get_statistics().open_circuits, vec!["review"]);

        assert!(supervisor.reset_circuit("review"));
        let result: Result<(), StageError> = supervisor
            .execute_with_supervision("review", |_attempt| async { Ok(()) })
            .await;
        assert!(result.is_ok());
    }
}

// =============================================================================
// Arbitration
// =============================================================================

mod arbitration {
    use pipewright::arbiter::ReviewCategory;
    use pipewright::{Candidate, Confidence, ReviewRecord, select_winner};

    #[test]
    fn test_dominant_candidate_wins_with_high_confidence() {
        let strong = Candidate::new("dev-1", 1.0, 90.0, 120);
        let weak = Candidate::new("dev-2", 0.4, 50.0, 900);
        let reviews = vec![
            ReviewRecord::new("dev-1", ReviewCategory::Security, 95.0),
            ReviewRecord::new("dev-2", ReviewCategory::Security, 40.0),
        ];

        let result = select_winner(&weak, &strong, &reviews);
        assert_eq!(result.winner, "dev-1");
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.margin >= 15.0);
        assert_eq!(result.scores.len(), 2);
    }
}
