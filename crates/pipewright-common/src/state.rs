//! Pipeline-level and stage-level states.
//!
//! The two enums are deliberately independent: a pipeline can sit in
//! `Running` while several of its stages are individually `Running`,
//! `Completed` or `Failed`.

use crate::ParseEnumError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overall state of a card's pipeline. Exactly one is current per card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Initializing,
    Running,
    StageRunning,
    StageComplete,
    Recovering,
    Failed,
    Completed,
    Paused,
    Cancelled,
}

impl PipelineState {
    pub const ALL: [PipelineState; 10] = [
        Self::Idle,
        Self::Initializing,
        Self::Running,
        Self::StageRunning,
        Self::StageComplete,
        Self::Recovering,
        Self::Failed,
        Self::Completed,
        Self::Paused,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::StageRunning => "stage_running",
            Self::StageComplete => "stage_complete",
            Self::Recovering => "recovering",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// States in which stages are (or may be) executing.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::StageRunning | Self::StageComplete | Self::Recovering
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("pipeline state", s))
    }
}

/// State of a single named stage within a card's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(ParseEnumError::new("stage state", s)),
        }
    }
}
