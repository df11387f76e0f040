//! Durable per-card records.
//!
//! Each card has exactly one record holding its state machine snapshot, its
//! checkpoint and its supervisor health counters, so the whole execution
//! context can be rebuilt from a single keyed read after a restart.
//!
//! [`FileStore`] writes `<state_dir>/<stem>.json` by locking a sidecar file,
//! writing a temp file, syncing it and renaming it over the record. A crash
//! mid-write leaves the previous fully-flushed record in place. The stem is
//! the sanitized card id plus a short hash of the raw id, so ids that
//! sanitize alike still land in different files.
//!
//! The store also keeps the cost ledger shared by every run, under
//! `<state_dir>/ledger/cost.json`.

use crate::checkpoint::{Checkpoint, StageCheckpoint, fingerprint};
use crate::state::MachineSnapshot;
use crate::supervisor::{CostSummary, HealthReport};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use pipewright_common::PipelineState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Everything persisted for one card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub card_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn new(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            machine: None,
            checkpoint: None,
            health: None,
            updated_at: Utc::now(),
        }
    }

    /// A record is resumable while its checkpoint (or, lacking one, its
    /// machine) has not reached a terminal state. An abandoned pipeline
    /// never is.
    pub fn is_resumable(&self) -> bool {
        if let Some(machine) = &self.machine
            && machine.current_state == PipelineState::Cancelled
        {
            return false;
        }
        match (&self.checkpoint, &self.machine) {
            (Some(checkpoint), _) => checkpoint.is_resumable(),
            (None, Some(machine)) => !machine.current_state.is_terminal(),
            (None, None) => false,
        }
    }
}

/// Persisted pipeline/stage record store.
///
/// Implementors provide keyed read/update/list/clear; the named accessors
/// are built on top of those.
pub trait PipelineStore: Send + Sync {
    fn load_record(&self, card_id: &str) -> Result<Option<PipelineRecord>>;

    /// Read-modify-write the card's record, creating it if absent.
    fn update_record(
        &self,
        card_id: &str,
        update: &mut dyn FnMut(&mut PipelineRecord),
    ) -> Result<()>;

    fn list_cards(&self) -> Result<Vec<String>>;

    fn clear(&self, card_id: &str) -> Result<()>;

    /// Persist the cost ledger shared across runs. A snapshot older than
    /// the stored one is ignored.
    fn save_cost_ledger(&self, summary: &CostSummary) -> Result<()>;

    fn load_cost_ledger(&self) -> Result<Option<CostSummary>>;

    fn save_pipeline_state(&self, card_id: &str, snapshot: &MachineSnapshot) -> Result<()> {
        self.update_record(card_id, &mut |record| {
            record.machine = Some(snapshot.clone());
        })
    }

    fn load_pipeline_state(&self, card_id: &str) -> Result<Option<MachineSnapshot>> {
        Ok(self.load_record(card_id)?.and_then(|r| r.machine))
    }

    fn save_checkpoint(&self, card_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.update_record(card_id, &mut |record| {
            record.checkpoint = Some(checkpoint.clone());
        })
    }

    fn load_checkpoint(&self, card_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.load_record(card_id)?.and_then(|r| r.checkpoint))
    }

    /// Store one stage sub-record inside the card's existing checkpoint.
    fn save_stage_checkpoint(&self, card_id: &str, stage: &StageCheckpoint) -> Result<()> {
        let mut missing = false;
        self.update_record(card_id, &mut |record| match record.checkpoint.as_mut() {
            Some(checkpoint) => {
                checkpoint
                    .stages
                    .insert(stage.stage_name.clone(), stage.clone());
            }
            None => missing = true,
        })?;
        if missing {
            anyhow::bail!("No checkpoint for card {} to attach stage to", card_id);
        }
        Ok(())
    }

    fn load_stage_checkpoints(&self, card_id: &str) -> Result<BTreeMap<String, StageCheckpoint>> {
        Ok(self
            .load_checkpoint(card_id)?
            .map(|c| c.stages)
            .unwrap_or_default())
    }

    fn save_health(&self, card_id: &str, report: &HealthReport) -> Result<()> {
        self.update_record(card_id, &mut |record| {
            record.health = Some(report.clone());
        })
    }

    /// Card ids whose pipelines can be resumed.
    fn get_resumable_pipelines(&self) -> Result<Vec<String>> {
        let mut resumable = Vec::new();
        for card_id in self.list_cards()? {
            if let Some(record) = self.load_record(&card_id)?
                && record.is_resumable()
            {
                resumable.push(card_id);
            }
        }
        resumable.sort();
        Ok(resumable)
    }
}

/// JSON-file backed store, one file per card.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for a card.
    pub fn record_path(&self, card_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(card_id)))
    }

    fn lock_path(&self, card_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(card_id)))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join("ledger").join("cost.json")
    }

    /// Run `f` while holding an exclusive lock on `lock_path`.
    fn with_lock<R>(lock_path: &Path, f: impl FnOnce() -> Result<R>) -> Result<R> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
        }
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        lock_file.lock_exclusive().context("Failed to take lock")?;

        let result = f();

        lock_file.unlock().context("Failed to release lock")?;
        result
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Read a card's record, refusing one that belongs to a different card.
    fn read_record(path: &Path, card_id: &str) -> Result<Option<PipelineRecord>> {
        let record: Option<PipelineRecord> = Self::read_json(path)?;
        if let Some(record) = &record
            && record.card_id != card_id
        {
            bail!(
                "Record {} belongs to card '{}', not '{}'",
                path.display(),
                record.card_id,
                card_id
            );
        }
        Ok(record)
    }

    fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", path.display()))?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            file.sync_all().context("Failed to flush record")?;
        }
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl PipelineStore for FileStore {
    fn load_record(&self, card_id: &str) -> Result<Option<PipelineRecord>> {
        Self::read_record(&self.record_path(card_id), card_id)
    }

    fn update_record(
        &self,
        card_id: &str,
        update: &mut dyn FnMut(&mut PipelineRecord),
    ) -> Result<()> {
        let path = self.record_path(card_id);
        Self::with_lock(&self.lock_path(card_id), || {
            let mut record =
                Self::read_record(&path, card_id)?.unwrap_or_else(|| PipelineRecord::new(card_id));
            update(&mut record);
            record.updated_at = Utc::now();
            Self::write_atomic(&path, &record)
        })
    }

    fn list_cards(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut cards = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false)
                && let Some(record) = Self::read_json::<PipelineRecord>(&path)?
            {
                cards.push(record.card_id);
            }
        }
        cards.sort();
        Ok(cards)
    }

    fn clear(&self, card_id: &str) -> Result<()> {
        let path = self.record_path(card_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove record {}", path.display()))?;
        }
        let lock = self.lock_path(card_id);
        if lock.exists() {
            fs::remove_file(&lock).ok();
        }
        Ok(())
    }

    fn save_cost_ledger(&self, summary: &CostSummary) -> Result<()> {
        let path = self.ledger_path();
        Self::with_lock(&path.with_extension("lock"), || {
            if let Some(existing) = Self::read_json::<CostSummary>(&path)?
                && !summary.supersedes(&existing)
            {
                debug!(
                    calls = summary.seen_calls(),
                    stored_calls = existing.seen_calls(),
                    "Skipping stale cost ledger snapshot"
                );
                return Ok(());
            }
            Self::write_atomic(&path, summary)
        })
    }

    fn load_cost_ledger(&self) -> Result<Option<CostSummary>> {
        Self::read_json(&self.ledger_path())
    }
}

/// In-process store with the same contract, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, PipelineRecord>>,
    ledger: Mutex<Option<CostSummary>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStore for MemoryStore {
    fn load_record(&self, card_id: &str) -> Result<Option<PipelineRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(records.get(card_id).cloned())
    }

    fn update_record(
        &self,
        card_id: &str,
        update: &mut dyn FnMut(&mut PipelineRecord),
    ) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        let record = records
            .entry(card_id.to_string())
            .or_insert_with(|| PipelineRecord::new(card_id));
        update(record);
        record.updated_at = Utc::now();
        Ok(())
    }

    fn list_cards(&self) -> Result<Vec<String>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        let mut cards: Vec<String> = records.keys().cloned().collect();
        cards.sort();
        Ok(cards)
    }

    fn clear(&self, card_id: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        records.remove(card_id);
        Ok(())
    }

    fn save_cost_ledger(&self, summary: &CostSummary) -> Result<()> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        if ledger.as_ref().map(|existing| summary.supersedes(existing)).unwrap_or(true) {
            *ledger = Some(summary.clone());
        }
        Ok(())
    }

    fn load_cost_ledger(&self) -> Result<Option<CostSummary>> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(ledger.clone())
    }
}

/// Longest sanitized prefix kept in a file stem.
const MAX_STEM_PREFIX: usize = 64;

/// Map a card id onto a safe, collision-free file stem: the id with unsafe
/// characters replaced, followed by a short hash of the raw id.
pub(crate) fn file_stem(card_id: &str) -> String {
    let readable: String = card_id
        .chars()
        .take(MAX_STEM_PREFIX)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", readable, &fingerprint(card_id)[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStatus;
    use pipewright_common::{PipelineState, StageState};

    fn checkpoint(card: &str, total: usize) -> Checkpoint {
        Checkpoint::new(card, total)
    }

    #[test]
    fn test_file_stem_sanitizes() {
        assert!(file_stem("card-1").starts_with("card-1-"));
        assert!(file_stem("org/card 7").starts_with("org_card_7-"));
        assert!(!file_stem("../escape").contains('/'));
        assert_eq!(file_stem("card-1"), file_stem("card-1"));
    }

    #[test]
    fn test_ids_that_sanitize_alike_get_separate_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert_ne!(store.record_path("team/42"), store.record_path("team_42"));

        store.save_checkpoint("team/42", &checkpoint("team/42", 3)).unwrap();
        store.save_checkpoint("team_42", &checkpoint("team_42", 5)).unwrap();

        let slash = store.load_checkpoint("team/42").unwrap().unwrap();
        let underscore = store.load_checkpoint("team_42").unwrap().unwrap();
        assert_eq!(slash.total_stages, 3);
        assert_eq!(underscore.total_stages, 5);
        assert_eq!(
            store.list_cards().unwrap(),
            vec!["team/42".to_string(), "team_42".to_string()]
        );
    }

    #[test]
    fn test_record_for_another_card_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save_checkpoint("a", &checkpoint("a", 1)).unwrap();
        fs::copy(store.record_path("a"), store.record_path("b")).unwrap();

        let err = store.load_record("b").unwrap_err();
        assert!(err.to_string().contains("belongs to card 'a'"));
        assert!(store.save_checkpoint("b", &checkpoint("b", 1)).is_err());
    }

    #[test]
    fn test_file_store_roundtrip_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path());
            store.save_checkpoint("c-1", &checkpoint("c-1", 4)).unwrap();
            let mut snapshot = MachineSnapshot::new("c-1");
            snapshot.current_state = PipelineState::Running;
            store.save_pipeline_state("c-1", &snapshot).unwrap();
        }

        let store = FileStore::new(dir.path());
        let record = store.load_record("c-1").unwrap().unwrap();
        assert_eq!(record.card_id, "c-1");
        assert_eq!(record.checkpoint.unwrap().total_stages, 4);
        assert_eq!(record.machine.unwrap().current_state, PipelineState::Running);
        assert!(!store.record_path("c-1").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_save_stage_checkpoint_requires_checkpoint() {
        let store = MemoryStore::new();
        let stage = StageCheckpoint::new("analysis", StageState::Completed);
        assert!(store.save_stage_checkpoint("c-1", &stage).is_err());

        store.save_checkpoint("c-1", &checkpoint("c-1", 2)).unwrap();
        store.save_stage_checkpoint("c-1", &stage).unwrap();
        let stages = store.load_stage_checkpoints("c-1").unwrap();
        assert!(stages.contains_key("analysis"));
    }

    #[test]
    fn test_resumable_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.save_checkpoint("active", &checkpoint("active", 3)).unwrap();

        let mut done = checkpoint("done", 3);
        done.status = CheckpointStatus::Completed;
        store.save_checkpoint("done", &done).unwrap();

        let mut snapshot = MachineSnapshot::new("machine-only");
        snapshot.current_state = PipelineState::StageRunning;
        store.save_pipeline_state("machine-only", &snapshot).unwrap();

        assert_eq!(
            store.get_resumable_pipelines().unwrap(),
            vec!["active".to_string(), "machine-only".to_string()]
        );
    }

    #[test]
    fn test_clear_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save_checkpoint("c-9", &checkpoint("c-9", 1)).unwrap();
        assert!(store.record_path("c-9").exists());

        store.clear("c-9").unwrap();
        assert!(store.load_record("c-9").unwrap().is_none());
        assert!(store.list_cards().unwrap().is_empty());
    }

    fn ledger(day: u32, calls: u64, spent: f64) -> CostSummary {
        CostSummary {
            total_cost: spent,
            daily_cost: spent,
            monthly_cost: spent,
            calls,
            as_of: chrono::NaiveDate::from_ymd_opt(2026, 3, day),
            ..CostSummary::default()
        }
    }

    #[test]
    fn test_cost_ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path())
            .save_cost_ledger(&ledger(1, 2, 0.5))
            .unwrap();

        let store = FileStore::new(dir.path());
        let loaded = store.load_cost_ledger().unwrap().unwrap();
        assert_eq!(loaded.calls, 2);
        assert_eq!(loaded.daily_cost, 0.5);
        assert!(store.list_cards().unwrap().is_empty());
    }

    #[test]
    fn test_stale_cost_ledger_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileStore::new(dir.path());
        let memory = MemoryStore::new();
        let stores: [&dyn PipelineStore; 2] = [&file, &memory];
        for store in stores {
            store.save_cost_ledger(&ledger(2, 5, 1.0)).unwrap();
            store.save_cost_ledger(&ledger(2, 3, 0.4)).unwrap();
            store.save_cost_ledger(&ledger(1, 9, 2.0)).unwrap();
            assert_eq!(store.load_cost_ledger().unwrap().unwrap().calls, 5);

            store.save_cost_ledger(&ledger(3, 1, 0.1)).unwrap();
            assert_eq!(store.load_cost_ledger().unwrap().unwrap().calls, 1);
        }
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        assert!(store.load_pipeline_state("x").unwrap().is_none());
        store.save_checkpoint("x", &checkpoint("x", 1)).unwrap();
        assert_eq!(store.list_cards().unwrap(), vec!["x".to_string()]);
        store.clear("x").unwrap();
        assert!(store.list_cards().unwrap().is_empty());
    }
}
