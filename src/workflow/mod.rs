//! Recovery workflows.
//!
//! Every [`IssueType`] maps to exactly one [`Workflow`]: an ordered list of
//! actions, each naming a handler in the [`HandlerRegistry`]. The engine runs
//! the actions in order and stops at the first failing action that is not
//! marked best-effort.
//!
//! Workflows are registered at startup and never change afterwards.
//! [`WorkflowEngine::with_builtins`] refuses to build unless every issue
//! type is covered.

pub mod catalog;
pub mod classify;
pub mod handlers;

pub use classify::classify;
pub use handlers::{HandlerCategory, HandlerOutcome, HandlerRegistry, RecoveryHandler};

use crate::errors::{ConfigError, PipelineError};
use pipewright_common::IssueType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a handler may look at while remediating an issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub card_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    /// Directory generated code and scratch files live in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Directory holding durable per-card records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl RecoveryContext {
    pub fn new(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// One remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub name: String,
    /// Registry key of the handler that performs the step
    pub handler: String,
    /// What should hold once the step succeeds
    pub postcondition: String,
    /// Failure does not stop the workflow
    #[serde(default)]
    pub best_effort: bool,
}

impl WorkflowAction {
    pub fn new(name: &str, handler: &str, postcondition: &str) -> Self {
        Self {
            name: name.to_string(),
            handler: handler.to_string(),
            postcondition: postcondition.to_string(),
            best_effort: false,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub issue: IssueType,
    pub name: String,
    pub actions: Vec<WorkflowAction>,
}

impl Workflow {
    pub fn new(issue: IssueType, name: &str, actions: Vec<WorkflowAction>) -> Self {
        Self {
            issue,
            name: name.to_string(),
            actions,
        }
    }
}

/// Outcome of a single action within a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub handler: String,
    pub success: bool,
    pub details: String,
    pub best_effort: bool,
}

/// Result of running a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub issue: IssueType,
    pub workflow: String,
    /// True only if the terminal action reported resolution
    pub success: bool,
    pub actions: Vec<ActionOutcome>,
    /// Hints handlers passed back to the caller (e.g. a failover provider)
    pub updates: BTreeMap<String, String>,
    pub duration_seconds: f64,
}

impl WorkflowRun {
    /// The action that stopped the run, if any.
    pub fn failed_action(&self) -> Option<&ActionOutcome> {
        self.actions.iter().find(|a| !a.success && !a.best_effort)
    }
}

pub struct WorkflowEngine {
    handlers: HandlerRegistry,
    workflows: HashMap<IssueType, Workflow>,
}

impl WorkflowEngine {
    /// Engine with no workflows; register them, then call
    /// [`validate_coverage`](Self::validate_coverage).
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers,
            workflows: HashMap::new(),
        }
    }

    /// Built-in handlers and the full built-in catalog, coverage-checked.
    pub fn with_builtins() -> Result<Self, ConfigError> {
        let mut engine = Self::new(HandlerRegistry::with_builtins());
        for workflow in catalog::builtin_workflows() {
            engine.register_workflow(workflow)?;
        }
        engine.validate_coverage()?;
        Ok(engine)
    }

    /// Register a workflow. Each issue type can be registered once.
    pub fn register_workflow(&mut self, workflow: Workflow) -> Result<(), ConfigError> {
        if workflow.actions.is_empty() {
            return Err(ConfigError::EmptyWorkflow {
                issue: workflow.issue,
            });
        }
        for action in &workflow.actions {
            if !self.handlers.contains(&action.handler) {
                return Err(ConfigError::UnknownHandler {
                    issue: workflow.issue,
                    handler: action.handler.clone(),
                });
            }
        }
        if self.workflows.contains_key(&workflow.issue) {
            return Err(ConfigError::Other(anyhow::anyhow!(
                "Workflow for '{}' is already registered",
                workflow.issue
            )));
        }
        debug!(issue = %workflow.issue, workflow = %workflow.name, "Registered workflow");
        self.workflows.insert(workflow.issue, workflow);
        Ok(())
    }

    /// Fail unless every issue type has a workflow.
    pub fn validate_coverage(&self) -> Result<(), ConfigError> {
        match IssueType::ALL
            .iter()
            .find(|issue| !self.workflows.contains_key(issue))
        {
            Some(issue) => Err(ConfigError::MissingWorkflow { issue: *issue }),
            None => Ok(()),
        }
    }

    pub fn workflow(&self, issue: IssueType) -> Option<&Workflow> {
        self.workflows.get(&issue)
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    /// Run the workflow for `issue`. Handlers may touch the filesystem,
    /// spawn commands or wait on the network.
    pub async fn execute(
        &self,
        issue: IssueType,
        context: &RecoveryContext,
    ) -> Result<WorkflowRun, PipelineError> {
        let workflow = self
            .workflows
            .get(&issue)
            .ok_or(PipelineError::UnregisteredIssue { issue })?;

        let started = Instant::now();
        info!(
            card_id = %context.card_id,
            stage = ?context.stage,
            %issue,
            workflow = %workflow.name,
            "Running recovery workflow"
        );

        let mut outcomes = Vec::with_capacity(workflow.actions.len());
        let mut updates = BTreeMap::new();
        let mut success = false;

        for action in &workflow.actions {
            let outcome = match self.handlers.get(&action.handler) {
                Some(handler) => handler.handle(context).await,
                None => HandlerOutcome::failure(format!("Handler '{}' not found", action.handler)),
            };
            debug!(
                action = %action.name,
                handler = %action.handler,
                success = outcome.success,
                details = %outcome.details,
                "Workflow action finished"
            );

            success = outcome.success;
            updates.extend(outcome.updates);
            outcomes.push(ActionOutcome {
                action: action.name.clone(),
                handler: action.handler.clone(),
                success: outcome.success,
                details: outcome.details,
                best_effort: action.best_effort,
            });

            if !outcome.success && !action.best_effort {
                warn!(
                    %issue,
                    action = %action.name,
                    "Recovery action failed; stopping workflow"
                );
                break;
            }
        }

        Ok(WorkflowRun {
            issue,
            workflow: workflow.name.clone(),
            success,
            actions: outcomes,
            updates,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        success: bool,
    }

    #[async_trait]
    impl RecoveryHandler for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn category(&self) -> HandlerCategory {
            HandlerCategory::StageRepair
        }

        async fn handle(&self, _context: &RecoveryContext) -> HandlerOutcome {
            if self.success {
                HandlerOutcome::ok(self.name).with_update(self.name, "ran")
            } else {
                HandlerOutcome::failure(self.name)
            }
        }
    }

    fn engine_with(actions: Vec<WorkflowAction>) -> WorkflowEngine {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Fixed { name: "pass", success: true }));
        registry.register(Arc::new(Fixed { name: "pass2", success: true }));
        registry.register(Arc::new(Fixed { name: "fail", success: false }));
        let mut engine = WorkflowEngine::new(registry);
        engine
            .register_workflow(Workflow::new(IssueType::Timeout, "timeout", actions))
            .unwrap();
        engine
    }

    #[test]
    fn test_builtins_cover_every_issue() {
        let engine = WorkflowEngine::with_builtins().unwrap();
        assert_eq!(engine.workflow_count(), IssueType::ALL.len());
        for issue in IssueType::ALL {
            assert!(engine.workflow(issue).is_some(), "missing {}", issue);
        }
    }

    #[test]
    fn test_missing_coverage_is_config_error() {
        let engine = engine_with(vec![WorkflowAction::new("a", "pass", "ok")]);
        assert!(matches!(
            engine.validate_coverage(),
            Err(ConfigError::MissingWorkflow { .. })
        ));
    }

    #[test]
    fn test_register_rejects_bad_workflows() {
        let mut engine = WorkflowEngine::new(HandlerRegistry::with_builtins());
        let err = engine
            .register_workflow(Workflow::new(IssueType::DiskFull, "empty", vec![]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyWorkflow { .. }));

        let err = engine
            .register_workflow(Workflow::new(
                IssueType::DiskFull,
                "bad",
                vec![WorkflowAction::new("x", "no_such_handler", "n/a")],
            ))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandler { .. }));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut engine = engine_with(vec![WorkflowAction::new("a", "pass", "ok")]);
        assert!(
            engine
                .register_workflow(Workflow::new(
                    IssueType::Timeout,
                    "again",
                    vec![WorkflowAction::new("a", "pass", "ok")],
                ))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_stops_at_first_hard_failure() {
        let engine = engine_with(vec![
            WorkflowAction::new("first", "pass", "ok"),
            WorkflowAction::new("second", "fail", "ok"),
            WorkflowAction::new("third", "pass2", "ok"),
        ]);
        let run = engine
            .execute(IssueType::Timeout, &RecoveryContext::new("c-1"))
            .await
            .unwrap();
        assert!(!run.success);
        assert_eq!(run.actions.len(), 2);
        assert_eq!(run.failed_action().unwrap().action, "second");
        assert!(!run.updates.contains_key("pass2"));
    }

    #[tokio::test]
    async fn test_best_effort_failure_continues() {
        let engine = engine_with(vec![
            WorkflowAction::new("first", "fail", "ok").best_effort(),
            WorkflowAction::new("second", "pass", "ok"),
        ]);
        let run = engine
            .execute(IssueType::Timeout, &RecoveryContext::new("c-1"))
            .await
            .unwrap();
        assert!(run.success);
        assert_eq!(run.actions.len(), 2);
        assert_eq!(run.updates.get("pass").map(String::as_str), Some("ran"));
    }

    #[tokio::test]
    async fn test_terminal_best_effort_failure_is_unresolved() {
        let engine = engine_with(vec![
            WorkflowAction::new("first", "pass", "ok"),
            WorkflowAction::new("last", "fail", "ok").best_effort(),
        ]);
        let run = engine
            .execute(IssueType::Timeout, &RecoveryContext::new("c-1"))
            .await
            .unwrap();
        assert!(!run.success);
        assert!(run.failed_action().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_issue() {
        let engine = engine_with(vec![WorkflowAction::new("a", "pass", "ok")]);
        let err = engine
            .execute(IssueType::DiskFull, &RecoveryContext::new("c-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnregisteredIssue { .. }));
    }
}
