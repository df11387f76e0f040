//! Pipeline state tracking: the transition-checked state machine and its
//! pushdown stack of execution contexts.

pub mod machine;
pub mod stack;

pub use machine::{
    IssueRecord, MachineSnapshot, PipelineStateMachine, STAGE_KEY, StateTransition,
    is_valid_transition,
};
pub use stack::{StateStack, StateStackFrame};

use std::sync::{Arc, Mutex};

/// State machine shared between the runner, supervisor and observers.
pub type SharedMachine = Arc<Mutex<PipelineStateMachine>>;
