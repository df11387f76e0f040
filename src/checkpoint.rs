//! Per-card progress record enabling resume after a crash.
//!
//! A [`Checkpoint`] tracks how many stages have completed, in what order,
//! and per-stage sub-records with timing, results, artifacts and cached
//! worker outputs. It is resumable while its status is anything but
//! COMPLETED; once completed it can no longer change.
//!
//! Every mutation is flushed to the [`PipelineStore`] before returning. A
//! crash mid-write leaves the previous record, so a stage may be replayed
//! after restart; stages can detect replay through
//! [`CheckpointManager::get_cached_output`].

use crate::errors::PipelineError;
use crate::store::PipelineStore;
use chrono::{DateTime, Utc};
use pipewright_common::StageState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Active,
    Resumed,
    Paused,
    Failed,
    Completed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-record for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub stage_name: String,
    pub status: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Request fingerprint -> worker output
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cached_outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageCheckpoint {
    pub fn new(stage_name: &str, status: StageState) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            status,
            result: None,
            artifacts: Vec::new(),
            cached_outputs: BTreeMap::new(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Fields to write into a stage sub-record. Unset optional fields keep
/// their previous value; cached outputs are merged.
#[derive(Debug, Clone)]
pub struct StageCheckpointUpdate {
    pub status: StageState,
    pub result: Option<Value>,
    pub artifacts: Option<Vec<String>>,
    pub cached_outputs: BTreeMap<String, Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageCheckpointUpdate {
    pub fn new(status: StageState) -> Self {
        Self {
            status,
            result: None,
            artifacts: None,
            cached_outputs: BTreeMap::new(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_cached_output(mut self, fingerprint: &str, output: Value) -> Self {
        self.cached_outputs.insert(fingerprint.to_string(), output);
        self
    }

    pub fn with_times(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub card_id: String,
    pub total_stages: usize,
    pub stages_completed: usize,
    /// Completed stage names in completion order
    pub completed_stages: Vec<String>,
    pub status: CheckpointStatus,
    pub resume_count: u32,
    #[serde(default)]
    pub stages: BTreeMap<String, StageCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(card_id: &str, total_stages: usize) -> Self {
        let now = Utc::now();
        Self {
            card_id: card_id.to_string(),
            total_stages,
            stages_completed: 0,
            completed_stages: Vec::new(),
            status: CheckpointStatus::Active,
            resume_count: 0,
            stages: BTreeMap::new(),
            failed_stage: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.status != CheckpointStatus::Completed
    }

    pub fn is_stage_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    pub fn last_completed_stage(&self) -> Option<&str> {
        self.completed_stages.last().map(String::as_str)
    }

    pub fn progress(&self) -> Progress {
        let progress_percent = if self.total_stages == 0 {
            100.0
        } else {
            self.stages_completed as f64 / self.total_stages as f64 * 100.0
        };
        Progress {
            stages_completed: self.stages_completed,
            total_stages: self.total_stages,
            progress_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stages_completed: usize,
    pub total_stages: usize,
    pub progress_percent: f64,
}

/// Hex SHA-256 of a prompt or request, used as the cache key.
pub fn fingerprint(request: &str) -> String {
    format!("{:x}", Sha256::digest(request.as_bytes()))
}

/// Owns a card's checkpoint and keeps it in sync with the store.
pub struct CheckpointManager {
    card_id: String,
    store: Arc<dyn PipelineStore>,
    checkpoint: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(card_id: &str, store: Arc<dyn PipelineStore>) -> Self {
        Self {
            card_id: card_id.to_string(),
            store,
            checkpoint: None,
        }
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Start a fresh ACTIVE checkpoint, replacing any previous one.
    pub fn create_checkpoint(&mut self, total_stages: usize) -> Result<&Checkpoint, PipelineError> {
        let checkpoint = Checkpoint::new(&self.card_id, total_stages);
        self.store
            .save_checkpoint(&self.card_id, &checkpoint)
            .map_err(PipelineError::Store)?;
        info!(card_id = %self.card_id, total_stages, "Checkpoint created");
        Ok(self.checkpoint.insert(checkpoint))
    }

    /// Load the persisted checkpoint and resume it.
    ///
    /// Returns `None` if there is no checkpoint or it is already COMPLETED.
    /// Otherwise bumps `resume_count`, sets status RESUMED and keeps the
    /// completed stage list intact.
    pub fn resume(&mut self) -> Result<Option<Checkpoint>, PipelineError> {
        let Some(mut checkpoint) = self
            .store
            .load_checkpoint(&self.card_id)
            .map_err(PipelineError::Store)?
        else {
            return Ok(None);
        };
        if !checkpoint.is_resumable() {
            debug!(card_id = %self.card_id, "Checkpoint already completed; not resuming");
            self.checkpoint = Some(checkpoint);
            return Ok(None);
        }

        checkpoint.resume_count += 1;
        checkpoint.status = CheckpointStatus::Resumed;
        checkpoint.updated_at = Utc::now();
        self.store
            .save_checkpoint(&self.card_id, &checkpoint)
            .map_err(PipelineError::Store)?;
        info!(
            card_id = %self.card_id,
            stages_completed = checkpoint.stages_completed,
            resume_count = checkpoint.resume_count,
            "Resumed from checkpoint"
        );
        self.checkpoint = Some(checkpoint.clone());
        Ok(Some(checkpoint))
    }

    fn current_mut(&mut self) -> Result<&mut Checkpoint, PipelineError> {
        let card_id = self.card_id.clone();
        let checkpoint = self
            .checkpoint
            .as_mut()
            .ok_or_else(|| PipelineError::NoCheckpoint {
                card_id: card_id.clone(),
            })?;
        if checkpoint.status == CheckpointStatus::Completed {
            return Err(PipelineError::CheckpointCompleted { card_id });
        }
        Ok(checkpoint)
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.updated_at = Utc::now();
            self.store
                .save_checkpoint(&self.card_id, checkpoint)
                .map_err(PipelineError::Store)?;
        }
        Ok(())
    }

    /// Write a stage sub-record. A COMPLETED status appends the stage to
    /// `completed_stages` (once).
    pub fn save_stage_checkpoint(
        &mut self,
        stage: &str,
        update: StageCheckpointUpdate,
    ) -> Result<(), PipelineError> {
        let checkpoint = self.current_mut()?;
        let record = checkpoint
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| StageCheckpoint::new(stage, update.status));

        record.status = update.status;
        if update.result.is_some() {
            record.result = update.result;
        }
        if let Some(artifacts) = update.artifacts {
            record.artifacts = artifacts;
        }
        record.cached_outputs.extend(update.cached_outputs);
        if update.start_time.is_some() {
            record.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            record.end_time = update.end_time;
        }
        if update.error.is_some() {
            record.error = update.error.clone();
        }

        match update.status {
            StageState::Completed if !checkpoint.is_stage_completed(stage) => {
                checkpoint.completed_stages.push(stage.to_string());
                checkpoint.stages_completed = checkpoint.completed_stages.len();
            }
            StageState::Failed => {
                checkpoint.failed_stage = Some(stage.to_string());
                checkpoint.last_error = update.error;
            }
            _ => {}
        }

        debug!(card_id = %self.card_id, stage, status = %update.status, "Stage checkpoint saved");
        self.flush()
    }

    /// First stage of `all_stages` not yet completed.
    pub fn get_next_stage<S: AsRef<str>>(&self, all_stages: &[S]) -> Option<String> {
        all_stages
            .iter()
            .map(AsRef::as_ref)
            .find(|name| {
                !self
                    .checkpoint
                    .as_ref()
                    .map(|c| c.is_stage_completed(name))
                    .unwrap_or(false)
            })
            .map(str::to_string)
    }

    pub fn get_progress(&self) -> Progress {
        match &self.checkpoint {
            Some(checkpoint) => checkpoint.progress(),
            None => Progress {
                stages_completed: 0,
                total_stages: 0,
                progress_percent: 0.0,
            },
        }
    }

    pub fn is_stage_completed(&self, stage: &str) -> bool {
        self.checkpoint
            .as_ref()
            .map(|c| c.is_stage_completed(stage))
            .unwrap_or(false)
    }

    pub fn stage_result(&self, stage: &str) -> Option<Value> {
        self.checkpoint
            .as_ref()
            .and_then(|c| c.stages.get(stage))
            .and_then(|s| s.result.clone())
    }

    /// Cached output for `(stage, fingerprint)`. A miss is `None`, not an error.
    pub fn get_cached_output(&self, stage: &str, fingerprint: &str) -> Option<Value> {
        self.checkpoint
            .as_ref()
            .and_then(|c| c.stages.get(stage))
            .and_then(|s| s.cached_outputs.get(fingerprint))
            .cloned()
    }

    pub fn cache_output(
        &mut self,
        stage: &str,
        fingerprint: &str,
        output: Value,
    ) -> Result<(), PipelineError> {
        let checkpoint = self.current_mut()?;
        checkpoint
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| StageCheckpoint::new(stage, StageState::Running))
            .cached_outputs
            .insert(fingerprint.to_string(), output);
        self.flush()
    }

    pub fn mark_completed(&mut self) -> Result<(), PipelineError> {
        self.current_mut()?.status = CheckpointStatus::Completed;
        info!(card_id = %self.card_id, "Checkpoint completed");
        self.flush()
    }

    pub fn mark_failed(&mut self, stage: &str, error: &str) -> Result<(), PipelineError> {
        let checkpoint = self.current_mut()?;
        checkpoint.status = CheckpointStatus::Failed;
        checkpoint.failed_stage = Some(stage.to_string());
        checkpoint.last_error = Some(error.to_string());
        self.flush()
    }

    pub fn pause(&mut self) -> Result<(), PipelineError> {
        self.current_mut()?.status = CheckpointStatus::Paused;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use serde_json::json;

    fn manager() -> CheckpointManager {
        CheckpointManager::new("c-1", Arc::new(MemoryStore::new()))
    }

    fn complete(m: &mut CheckpointManager, stage: &str) {
        m.save_stage_checkpoint(
            stage,
            StageCheckpointUpdate::new(StageState::Completed).with_result(json!({"stage": stage})),
        )
        .unwrap();
    }

    #[test]
    fn test_progress_is_exact() {
        let mut m = manager();
        m.create_checkpoint(4).unwrap();
        for stage in ["a", "b", "c"] {
            complete(&mut m, stage);
        }
        let progress = m.get_progress();
        assert_eq!(progress.stages_completed, 3);
        assert_eq!(progress.progress_percent, 75.0);
    }

    #[test]
    fn test_completing_twice_counts_once() {
        let mut m = manager();
        m.create_checkpoint(2).unwrap();
        complete(&mut m, "a");
        complete(&mut m, "a");
        assert_eq!(m.get_progress().stages_completed, 1);
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut m = manager();
        m.create_checkpoint(2).unwrap();
        complete(&mut m, "a");
        m.save_stage_checkpoint(
            "a",
            StageCheckpointUpdate::new(StageState::Failed).with_error("late failure"),
        )
        .unwrap();
        assert_eq!(m.get_progress().progress_percent, 50.0);
    }

    #[test]
    fn test_save_without_checkpoint_errors() {
        let mut m = manager();
        let err = m
            .save_stage_checkpoint("a", StageCheckpointUpdate::new(StageState::Running))
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoCheckpoint { .. }));
    }

    #[test]
    fn test_resume_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let stages = ["analysis", "design", "development", "review", "testing"];
        {
            let mut m = CheckpointManager::new("c-5", Arc::new(FileStore::new(dir.path())));
            m.create_checkpoint(stages.len()).unwrap();
            complete(&mut m, "analysis");
            complete(&mut m, "design");
        }

        let mut m = CheckpointManager::new("c-5", Arc::new(FileStore::new(dir.path())));
        let checkpoint = m.resume().unwrap().unwrap();
        assert_eq!(checkpoint.stages_completed, 2);
        assert_eq!(checkpoint.resume_count, 1);
        assert_eq!(checkpoint.status, CheckpointStatus::Resumed);
        assert_eq!(m.get_next_stage(&stages), Some("development".to_string()));
        assert_eq!(m.stage_result("design"), Some(json!({"stage": "design"})));

        let mut again = CheckpointManager::new("c-5", Arc::new(FileStore::new(dir.path())));
        assert_eq!(again.resume().unwrap().unwrap().resume_count, 2);
    }

    #[test]
    fn test_completed_checkpoint_is_final() {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let mut m = CheckpointManager::new("c-1", Arc::clone(&store));
        m.create_checkpoint(1).unwrap();
        complete(&mut m, "a");
        m.mark_completed().unwrap();

        assert!(matches!(
            m.save_stage_checkpoint("b", StageCheckpointUpdate::new(StageState::Running)),
            Err(PipelineError::CheckpointCompleted { .. })
        ));
        assert!(m.pause().is_err());

        let mut fresh = CheckpointManager::new("c-1", store);
        assert!(fresh.resume().unwrap().is_none());
    }

    #[test]
    fn test_paused_and_failed_are_resumable() {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let mut m = CheckpointManager::new("c-1", Arc::clone(&store));
        m.create_checkpoint(3).unwrap();
        m.pause().unwrap();
        assert!(CheckpointManager::new("c-1", Arc::clone(&store)).resume().unwrap().is_some());

        let mut m = CheckpointManager::new("c-1", Arc::clone(&store));
        m.resume().unwrap();
        m.mark_failed("b", "boom").unwrap();
        let resumed = CheckpointManager::new("c-1", store).resume().unwrap().unwrap();
        assert_eq!(resumed.failed_stage.as_deref(), Some("b"));
        assert_eq!(resumed.resume_count, 3);
    }

    #[test]
    fn test_cached_output_lookup() {
        let mut m = manager();
        m.create_checkpoint(2).unwrap();
        let key = fingerprint("implement the login form");
        assert!(m.get_cached_output("development", &key).is_none());

        m.cache_output("development", &key, json!("diff --git")).unwrap();
        assert_eq!(m.get_cached_output("development", &key), Some(json!("diff --git")));
        assert!(m.get_cached_output("development", &fingerprint("other")).is_none());
        assert!(m.get_cached_output("review", &key).is_none());

        // cache survives a later stage save
        complete(&mut m, "development");
        assert!(m.get_cached_output("development", &key).is_some());
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint("hello");
        assert_eq!(a, fingerprint("hello"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint("hello!"));
    }

    #[test]
    fn test_next_stage_without_checkpoint() {
        let m = manager();
        assert_eq!(m.get_next_stage(&["a", "b"]), Some("a".to_string()));
        assert_eq!(m.get_next_stage::<&str>(&[]), None);
    }
}
