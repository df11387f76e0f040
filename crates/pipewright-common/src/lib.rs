//! Shared domain types for the pipewright pipeline engine.
//!
//! Everything in this crate is plain data: pipeline and stage states, the
//! closed issue taxonomy and the work-item ("card") description consumed by
//! the planner. No I/O happens here.

pub mod card;
pub mod issue;
pub mod state;

pub use card::{Card, Priority};
pub use issue::{IssueCategory, IssueType};
pub use state::{PipelineState, StageState};

use thiserror::Error;

/// Returned by the `FromStr` impls in this crate when a string does not name a variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
