//! Pushdown stack of execution contexts.

use chrono::{DateTime, Utc};
use pipewright_common::PipelineState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry on the state stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStackFrame {
    pub state: PipelineState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl StateStackFrame {
    pub fn new(state: PipelineState, metadata: BTreeMap<String, String>) -> Self {
        Self {
            state,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Last-in-first-out sequence of frames.
///
/// Kept apart from the per-stage state map: the stack records nesting
/// (stage inside pipeline, retry inside stage), the map records progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateStack {
    frames: Vec<StateStackFrame>,
}

impl StateStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: StateStackFrame) {
        self.frames.push(frame);
    }

    pub fn peek(&self) -> Option<&StateStackFrame> {
        self.frames.last()
    }

    pub fn pop(&mut self) -> Option<StateStackFrame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, state: PipelineState) -> bool {
        self.frames.iter().any(|f| f.state == state)
    }

    /// Pop frames until the topmost frame with `target` is on top.
    ///
    /// Returns the popped frames (top first). If `target` is not on the
    /// stack nothing is popped and `None` is returned.
    pub fn rollback_to(&mut self, target: PipelineState) -> Option<Vec<StateStackFrame>> {
        self.rollback_to_matching(|f| f.state == target)
    }

    /// Like [`rollback_to`](Self::rollback_to) with an arbitrary frame predicate.
    pub fn rollback_to_matching<P>(&mut self, predicate: P) -> Option<Vec<StateStackFrame>>
    where
        P: Fn(&StateStackFrame) -> bool,
    {
        let index = self.frames.iter().rposition(predicate)?;
        let mut popped = self.frames.split_off(index + 1);
        popped.reverse();
        Some(popped)
    }

    /// Frames bottom to top.
    pub fn frames(&self) -> &[StateStackFrame] {
        &self.frames
    }
}
