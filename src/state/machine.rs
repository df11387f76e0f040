//! Per-card pipeline state machine.
//!
//! Transitions follow a fixed allow-list ([`is_valid_transition`]). A
//! rejected transition leaves the machine untouched and returns `false`.
//! Every accepted transition and every stage update is written through to
//! the attached [`PipelineStore`] before the call returns.

use super::stack::{StateStack, StateStackFrame};
use crate::errors::{ConfigError, PipelineError};
use crate::store::PipelineStore;
use crate::workflow::{RecoveryContext, WorkflowEngine, WorkflowRun};
use chrono::{DateTime, Utc};
use pipewright_common::{IssueType, PipelineState, StageState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Frame metadata key naming the stage a frame belongs to.
pub const STAGE_KEY: &str = "stage";

/// Whether `from -> to` is an allowed pipeline transition.
pub fn is_valid_transition(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::*;
    matches!(
        (from, to),
        (Idle, Initializing)
            | (Idle, Cancelled)
            | (Initializing, Running)
            | (Initializing, Failed)
            | (Initializing, Cancelled)
            | (Running, StageRunning)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Paused)
            | (Running, Cancelled)
            | (Running, Recovering)
            | (StageRunning, StageComplete)
            | (StageRunning, Failed)
            | (StageRunning, Recovering)
            | (StageRunning, Paused)
            | (StageRunning, Cancelled)
            | (StageComplete, StageRunning)
            | (StageComplete, Running)
            | (StageComplete, Completed)
            | (StageComplete, Failed)
            | (StageComplete, Paused)
            | (StageComplete, Cancelled)
            | (Recovering, Running)
            | (Recovering, StageRunning)
            | (Recovering, Failed)
            | (Recovering, Cancelled)
            | (Failed, Recovering)
            | (Failed, Initializing)
            | (Failed, Cancelled)
            | (Paused, Running)
            | (Paused, Recovering)
            | (Paused, Cancelled)
    )
}

/// One accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An issue raised against the card and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue: IssueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// `None` until a workflow has run for it
    #[serde(default)]
    pub resolved: Option<bool>,
}

/// Everything needed to rebuild a machine after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub card_id: String,
    pub current_state: PipelineState,
    #[serde(default)]
    pub stage_states: BTreeMap<String, StageState>,
    #[serde(default)]
    pub stack: StateStack,
    #[serde(default)]
    pub history: Vec<StateTransition>,
    #[serde(default)]
    pub issues: Vec<IssueRecord>,
    pub updated_at: DateTime<Utc>,
}

impl MachineSnapshot {
    pub fn new(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            current_state: PipelineState::Idle,
            stage_states: BTreeMap::new(),
            stack: StateStack::new(),
            history: Vec::new(),
            issues: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

pub struct PipelineStateMachine {
    snapshot: MachineSnapshot,
    workflows: Arc<WorkflowEngine>,
    store: Option<Arc<dyn PipelineStore>>,
}

impl PipelineStateMachine {
    /// Fresh machine in IDLE. Fails if any issue type lacks a workflow.
    pub fn new(card_id: &str, workflows: Arc<WorkflowEngine>) -> Result<Self, ConfigError> {
        workflows.validate_coverage()?;
        Ok(Self {
            snapshot: MachineSnapshot::new(card_id),
            workflows,
            store: None,
        })
    }

    /// Write every change through to `store`.
    pub fn with_store(mut self, store: Arc<dyn PipelineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Rebuild from the card's persisted record, or start fresh if there is none.
    pub fn restore(
        card_id: &str,
        workflows: Arc<WorkflowEngine>,
        store: Arc<dyn PipelineStore>,
    ) -> Result<Self, PipelineError> {
        workflows.validate_coverage()?;
        let snapshot = store
            .load_pipeline_state(card_id)
            .map_err(PipelineError::Store)?;
        let snapshot = match snapshot {
            Some(snapshot) => {
                info!(
                    card_id,
                    state = %snapshot.current_state,
                    stack_depth = snapshot.stack.depth(),
                    "Restored state machine"
                );
                snapshot
            }
            None => MachineSnapshot::new(card_id),
        };
        Ok(Self {
            snapshot,
            workflows,
            store: Some(store),
        })
    }

    pub fn card_id(&self) -> &str {
        &self.snapshot.card_id
    }

    pub fn current_state(&self) -> PipelineState {
        self.snapshot.current_state
    }

    pub fn snapshot(&self) -> &MachineSnapshot {
        &self.snapshot
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.snapshot.history
    }

    pub fn workflows(&self) -> Arc<WorkflowEngine> {
        Arc::clone(&self.workflows)
    }

    /// Move to `target`. Returns false (and changes nothing) if the move is
    /// not on the allow-list.
    pub fn transition(&mut self, target: PipelineState, event: &str, reason: Option<&str>) -> bool {
        let from = self.snapshot.current_state;
        if !is_valid_transition(from, target) {
            warn!(
                card_id = %self.snapshot.card_id,
                %from,
                to = %target,
                event,
                "Rejected state transition"
            );
            return false;
        }

        self.snapshot.current_state = target;
        self.snapshot.history.push(StateTransition {
            from,
            to: target,
            event: event.to_string(),
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        });
        debug!(card_id = %self.snapshot.card_id, %from, to = %target, event, "State transition");
        self.persist();
        true
    }

    pub fn push_state(&mut self, state: PipelineState, metadata: BTreeMap<String, String>) {
        self.snapshot
            .stack
            .push(StateStackFrame::new(state, metadata));
        self.persist();
    }

    pub fn peek_state(&self) -> Option<&StateStackFrame> {
        self.snapshot.stack.peek()
    }

    pub fn pop_state(&mut self) -> Option<StateStackFrame> {
        let frame = self.snapshot.stack.pop();
        if frame.is_some() {
            self.persist();
        }
        frame
    }

    /// Unwind the stack to the topmost `target` frame.
    ///
    /// Returns false, leaving the stack untouched, if `target` was never pushed.
    pub fn rollback_to_state(&mut self, target: PipelineState) -> bool {
        match self.snapshot.stack.rollback_to(target) {
            Some(popped) => {
                if !popped.is_empty() {
                    debug!(
                        card_id = %self.snapshot.card_id,
                        %target,
                        popped = popped.len(),
                        "Rolled back state stack"
                    );
                    self.persist();
                }
                true
            }
            None => false,
        }
    }

    /// Unwind a supervised stage's frames: everything above its STAGE_RUNNING
    /// frame, then that frame itself. False if the stage has no frame.
    pub fn unwind_stage(&mut self, stage: &str) -> bool {
        let owned = |f: &StateStackFrame| {
            f.state == PipelineState::StageRunning
                && f.metadata.get(STAGE_KEY).map(String::as_str) == Some(stage)
        };
        if self.snapshot.stack.rollback_to_matching(owned).is_none() {
            return false;
        }
        self.snapshot.stack.pop();
        self.persist();
        true
    }

    pub fn stack_depth(&self) -> usize {
        self.snapshot.stack.depth()
    }

    pub fn update_stage_state(&mut self, stage: &str, state: StageState) {
        self.snapshot
            .stage_states
            .insert(stage.to_string(), state);
        self.persist();
    }

    /// State of a stage; stages never updated are PENDING.
    pub fn stage_state(&self, stage: &str) -> StageState {
        self.snapshot
            .stage_states
            .get(stage)
            .copied()
            .unwrap_or_default()
    }

    pub fn stage_states(&self) -> &BTreeMap<String, StageState> {
        &self.snapshot.stage_states
    }

    /// Record an issue against the card.
    pub fn register_issue(&mut self, issue: IssueType, context: &RecoveryContext) {
        info!(
            card_id = %self.snapshot.card_id,
            %issue,
            category = %issue.category(),
            stage = ?context.stage,
            "Issue registered"
        );
        self.snapshot.issues.push(IssueRecord {
            issue,
            stage: context.stage.clone(),
            error: context.error.clone(),
            registered_at: Utc::now(),
            resolved: None,
        });
        self.persist();
    }

    /// Mark the most recent unresolved record of `issue` with a workflow result.
    pub fn record_workflow_result(&mut self, issue: IssueType, resolved: bool) {
        if let Some(record) = self
            .snapshot
            .issues
            .iter_mut()
            .rev()
            .find(|r| r.issue == issue && r.resolved.is_none())
        {
            record.resolved = Some(resolved);
            self.persist();
        }
    }

    /// Run the workflow for `issue` and record the outcome. True only if the
    /// workflow's terminal action reported resolution.
    ///
    /// Holds `&mut self` across the handlers; a machine shared behind a lock
    /// should take [`workflows`](Self::workflows) and run outside it instead.
    pub async fn execute_workflow(&mut self, issue: IssueType, context: &RecoveryContext) -> bool {
        let engine = Arc::clone(&self.workflows);
        let resolved = match engine.execute(issue, context).await {
            Ok(WorkflowRun { success, .. }) => success,
            Err(e) => {
                error!(card_id = %self.snapshot.card_id, %issue, error = %e, "Workflow failed to run");
                false
            }
        };
        self.record_workflow_result(issue, resolved);
        resolved
    }

    pub fn issues(&self) -> &[IssueRecord] {
        &self.snapshot.issues
    }

    fn persist(&mut self) {
        self.snapshot.updated_at = Utc::now();
        if let Some(store) = &self.store
            && let Err(e) = store.save_pipeline_state(&self.snapshot.card_id, &self.snapshot)
        {
            error!(
                card_id = %self.snapshot.card_id,
                error = %e,
                "Failed to persist state machine"
            );
        }
    }
}
