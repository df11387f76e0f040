//! Typed error hierarchy for pipewright.
//!
//! Four top-level enums cover the subsystems:
//! - `StageError`: supervised stage execution failures (retries, circuit, timeout)
//! - `BudgetExceeded`: cost governance ceiling crossed
//! - `ConfigError`: startup configuration problems (fatal)
//! - `PipelineError`: runner, state machine and checkpoint failures

use pipewright_common::IssueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from a single supervised stage invocation.
///
/// Only exhausted retries, open circuits, timeouts and cancellation reach the
/// calling strategy; transient failures are absorbed by the supervisor.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("Stage '{stage}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Circuit open for stage '{stage}' ({consecutive_failures} consecutive failures)")]
    CircuitOpen {
        stage: String,
        attempts: u32,
        consecutive_failures: u32,
    },

    #[error("Stage '{stage}' timed out after {seconds}s ({attempts} attempts)")]
    Timeout {
        stage: String,
        attempts: u32,
        seconds: f64,
    },

    #[error("Stage '{stage}' was not started: pipeline cancelled")]
    Cancelled { stage: String },
}

impl StageError {
    pub fn stage(&self) -> &str {
        match self {
            Self::RetriesExhausted { stage, .. }
            | Self::CircuitOpen { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::Cancelled { stage } => stage,
        }
    }

    /// Number of times the underlying stage was actually invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. }
            | Self::CircuitOpen { attempts, .. }
            | Self::Timeout { attempts, .. } => *attempts,
            Self::Cancelled { .. } => 0,
        }
    }
}

/// Accounting period a cost ceiling applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Raised by cost tracking once a configured ceiling is crossed.
///
/// Fatal for the triggering call only; the pipeline keeps running.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{period} budget exceeded: spent ${spent:.4} of ${limit:.4}")]
pub struct BudgetExceeded {
    pub period: BudgetPeriod,
    pub spent: f64,
    pub limit: f64,
}

/// Configuration errors. These are detected at startup and are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No workflow registered for issue type '{issue}'")]
    MissingWorkflow { issue: IssueType },

    #[error("Workflow for '{issue}' has no actions")]
    EmptyWorkflow { issue: IssueType },

    #[error("Workflow for '{issue}' references unknown handler '{handler}'")]
    UnknownHandler { issue: IssueType, handler: String },

    #[error("Invalid recovery strategy for '{stage}': {message}")]
    InvalidStrategy { stage: String, message: String },

    #[error("Invalid stage graph at '{stage}': {message}")]
    InvalidStageGraph { stage: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the pipeline runner, state machine and checkpoint store.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Record store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("State lock poisoned")]
    LockPoisoned,

    #[error("No checkpoint exists for card {card_id}")]
    NoCheckpoint { card_id: String },

    #[error("Checkpoint for card {card_id} is completed and can no longer change")]
    CheckpointCompleted { card_id: String },

    #[error("No workflow registered for issue type '{issue}'")]
    UnregisteredIssue { issue: IssueType },

    #[error("Pipeline for card {card_id} was abandoned; clear its record to start over")]
    Abandoned { card_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
