//! Observer bus for pipeline progress.
//!
//! Strategies publish [`PipelineEvent`]s here and never call state tracking
//! or metrics collaborators directly. Delivery is synchronous and
//! serialized under the bus lock, so observers see a card's events in the
//! order the stage transitions happened, even when stages run concurrently.
//! Observers must not emit on the bus they are subscribed to.

use crate::state::{SharedMachine, is_valid_transition};
use crate::strategy::RunStatus;
use pipewright_common::{PipelineState, StageState};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        card_id: String,
        total_stages: usize,
        resumed: bool,
    },
    StageStarted {
        card_id: String,
        stage: String,
    },
    StageCompleted {
        card_id: String,
        stage: String,
        duration_seconds: f64,
    },
    StageFailed {
        card_id: String,
        stage: String,
        error: String,
        attempts: u32,
    },
    StageSkipped {
        card_id: String,
        stage: String,
        reason: String,
    },
    /// A stage completed in an earlier run; its cached result was reused.
    StageRestored {
        card_id: String,
        stage: String,
    },
    PipelineFinished {
        card_id: String,
        status: RunStatus,
    },
}

impl PipelineEvent {
    pub fn card_id(&self) -> &str {
        match self {
            Self::PipelineStarted { card_id, .. }
            | Self::StageStarted { card_id, .. }
            | Self::StageCompleted { card_id, .. }
            | Self::StageFailed { card_id, .. }
            | Self::StageSkipped { card_id, .. }
            | Self::StageRestored { card_id, .. }
            | Self::PipelineFinished { card_id, .. } => card_id,
        }
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::StageSkipped { stage, .. }
            | Self::StageRestored { stage, .. } => Some(stage),
            Self::PipelineStarted { .. } | Self::PipelineFinished { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline_started",
            Self::StageStarted { .. } => "stage_started",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageFailed { .. } => "stage_failed",
            Self::StageSkipped { .. } => "stage_skipped",
            Self::StageRestored { .. } => "stage_restored",
            Self::PipelineFinished { .. } => "pipeline_finished",
        }
    }
}

pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

#[derive(Default)]
struct BusInner {
    observers: Vec<Arc<dyn PipelineObserver>>,
    forward: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn PipelineObserver>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .push(observer);
    }

    /// Also forward every event to a channel.
    pub fn with_channel(self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forward = Some(tx);
        self
    }

    pub fn emit(&self, event: PipelineEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(card_id = %event.card_id(), stage = ?event.stage(), kind = event.kind(), "Pipeline event");
        for observer in &inner.observers {
            observer.on_event(&event);
        }
        let closed = inner
            .forward
            .as_ref()
            .map(|tx| tx.send(event).is_err())
            .unwrap_or(false);
        if closed {
            // receiver gone; stop forwarding
            inner.forward = None;
        }
    }
}

/// Mirrors stage events onto the card's state machine.
pub struct StateTracker {
    machine: SharedMachine,
}

impl StateTracker {
    pub fn new(machine: SharedMachine) -> Self {
        Self { machine }
    }
}

impl PipelineObserver for StateTracker {
    fn on_event(&self, event: &PipelineEvent) {
        let Ok(mut machine) = self.machine.lock() else {
            warn!("State machine lock poisoned; dropping event");
            return;
        };
        let (stage, stage_state, target) = match event {
            PipelineEvent::StageStarted { stage, .. } => {
                (stage, StageState::Running, Some(PipelineState::StageRunning))
            }
            PipelineEvent::StageCompleted { stage, .. } => {
                (stage, StageState::Completed, Some(PipelineState::StageComplete))
            }
            PipelineEvent::StageFailed { stage, .. } => (stage, StageState::Failed, None),
            PipelineEvent::StageSkipped { stage, .. } => (stage, StageState::Skipped, None),
            PipelineEvent::StageRestored { stage, .. } => (stage, StageState::Completed, None),
            PipelineEvent::PipelineStarted { .. } | PipelineEvent::PipelineFinished { .. } => {
                return;
            }
        };

        machine.update_stage_state(stage, stage_state);
        if let Some(target) = target
            && is_valid_transition(machine.current_state(), target)
        {
            machine.transition(target, event.kind(), None);
        }
    }
}

/// Keeps every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<PipelineEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind, as (kind, stage) pairs in arrival order.
    pub fn stages_with(&self, kind: &str) -> Vec<String> {
        self.events()
            .iter()
            .filter(|e| e.kind() == kind)
            .filter_map(|e| e.stage().map(str::to_string))
            .collect()
    }
}

impl PipelineObserver for EventRecorder {
    fn on_event(&self, event: &PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
