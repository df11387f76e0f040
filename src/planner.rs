//! Card classification and execution shape.
//!
//! [`create_workflow_plan`] is a pure function of the card's text, priority
//! and size estimate. The same card always yields the same plan.

use pipewright_common::{Card, Priority};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Every stage a plan can contain, in execution order.
pub const ALL_STAGES: [&str; 8] = [
    "analysis",
    "architecture",
    "development",
    "arbitration",
    "review",
    "validation",
    "integration",
    "testing",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bugfix,
    Feature,
    Refactor,
    Documentation,
    Other,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bugfix => "bugfix",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Documentation => "documentation",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }

    pub fn parallel_developers(&self) -> u32 {
        match self {
            Self::Simple => 1,
            Self::Medium => 2,
            Self::Complex => 3,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub parallel_developers: u32,
    /// Stages to run, in order, with `skip_stages` already removed
    pub stages: Vec<String>,
    pub skip_stages: BTreeSet<String>,
    pub reasoning: String,
}

impl WorkflowPlan {
    pub fn skips(&self, stage: &str) -> bool {
        self.skip_stages.contains(stage)
    }
}

/// Keyword table, checked in priority order: the first type with a hit wins.
const TASK_KEYWORDS: &[(TaskType, &[&str])] = &[
    (
        TaskType::Documentation,
        &[
            "doc",
            "docs",
            "documentation",
            "document",
            "readme",
            "changelog",
            "guide",
            "tutorial",
            "docstring",
            "docstrings",
        ],
    ),
    (
        TaskType::Bugfix,
        &[
            "bug",
            "bugs",
            "fix",
            "fixes",
            "hotfix",
            "broken",
            "crash",
            "crashes",
            "regression",
            "defect",
            "error",
            "failing",
            "incorrect",
        ],
    ),
    (
        TaskType::Refactor,
        &[
            "refactor",
            "refactoring",
            "cleanup",
            "restructure",
            "reorganize",
            "simplify",
            "rename",
            "extract",
            "deduplicate",
            "modernize",
        ],
    ),
    (
        TaskType::Feature,
        &[
            "add",
            "implement",
            "feature",
            "support",
            "new",
            "create",
            "introduce",
            "enable",
            "build",
            "allow",
        ],
    ),
];

fn priority_weight(priority: Priority) -> u32 {
    match priority {
        Priority::Low => 0,
        Priority::Medium => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

fn size_weight(story_points: Option<u32>) -> u32 {
    match story_points {
        None => 1,
        Some(0..=2) => 0,
        Some(3..=5) => 1,
        Some(6..=8) => 2,
        Some(_) => 3,
    }
}

/// Classify by whole-word keyword match over title, description and labels.
/// Returns the type and the keyword that decided it.
pub fn classify_task(card: &Card) -> (TaskType, Option<&'static str>) {
    let text = format!("{} {} {}", card.title, card.description, card.labels.join(" "))
        .to_lowercase();
    let words: BTreeSet<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for (task_type, keywords) in TASK_KEYWORDS {
        if let Some(hit) = keywords.iter().find(|k| words.contains(*k)) {
            return (*task_type, Some(*hit));
        }
    }
    (TaskType::Other, None)
}

pub fn assess_complexity(card: &Card) -> Complexity {
    match priority_weight(card.priority) + size_weight(card.story_points) {
        0..=1 => Complexity::Simple,
        2..=3 => Complexity::Medium,
        _ => Complexity::Complex,
    }
}

pub fn create_workflow_plan(card: &Card) -> WorkflowPlan {
    let (task_type, keyword) = classify_task(card);
    let complexity = assess_complexity(card);

    let mut skip_stages = BTreeSet::new();
    if task_type == TaskType::Documentation {
        skip_stages.insert("testing".to_string());
    }
    if complexity == Complexity::Simple {
        skip_stages.insert("arbitration".to_string());
    }

    let stages = ALL_STAGES
        .iter()
        .filter(|s| !skip_stages.contains(**s))
        .map(|s| s.to_string())
        .collect();

    let matched = match keyword {
        Some(k) => format!("matched '{}'", k),
        None => "no keyword matched".to_string(),
    };
    let size = match card.story_points {
        Some(points) => format!("{} points", points),
        None => "unsized".to_string(),
    };
    let skipping = if skip_stages.is_empty() {
        "none".to_string()
    } else {
        skip_stages.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    let reasoning = format!(
        "{} task ({}); {} complexity from {} priority and {}; {} developer(s); skipping: {}",
        task_type,
        matched,
        complexity,
        card.priority.as_str(),
        size,
        complexity.parallel_developers(),
        skipping
    );

    WorkflowPlan {
        task_type,
        complexity,
        parallel_developers: complexity.parallel_developers(),
        stages,
        skip_stages,
        reasoning,
    }
}
