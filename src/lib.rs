//! Pipeline reliability and scheduling engine.
//!
//! A card flows through ordered stages. Each stage runs under a
//! [`Supervisor`](supervisor::Supervisor) that retries, circuit-breaks and
//! times out; failures are classified and repaired by recovery workflows on
//! the card's [`PipelineStateMachine`](state::PipelineStateMachine); progress
//! is checkpointed so a crashed run resumes where it stopped. The
//! [`PipelineRunner`](pipeline::PipelineRunner) ties it together.

pub mod arbiter;
pub mod checkpoint;
pub mod collab;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod planner;
pub mod state;
pub mod store;
pub mod strategy;
pub mod supervisor;
pub mod workflow;

pub use arbiter::{ArbitrationResult, Arbiter, Candidate, Confidence, ReviewRecord, select_winner};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStatus, Progress};
pub use config::{PipewrightConfig, PipewrightToml};
pub use errors::{BudgetExceeded, ConfigError, PipelineError, StageError};
pub use events::{EventBus, PipelineEvent, PipelineObserver};
pub use pipeline::{FailureReport, PipelineReport, PipelineRunner};
pub use planner::{WorkflowPlan, create_workflow_plan};
pub use store::{FileStore, MemoryStore, PipelineStore};
pub use strategy::{FnStage, RunStatus, Stage, StageInput, StrategyKind};
pub use supervisor::{RecoveryStrategy, Supervisor};

pub use pipewright_common::{Card, IssueType, PipelineState, Priority, StageState};
