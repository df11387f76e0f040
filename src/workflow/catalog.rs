//! Built-in workflow for every issue type.

use super::{Workflow, WorkflowAction};
use pipewright_common::IssueType;

fn step(name: &str, handler: &str, postcondition: &str) -> WorkflowAction {
    WorkflowAction::new(name, handler, postcondition)
}

fn try_step(name: &str, handler: &str, postcondition: &str) -> WorkflowAction {
    WorkflowAction::new(name, handler, postcondition).best_effort()
}

fn retry_stage() -> WorkflowAction {
    step("retry stage", "restart_stage", "stage queued for another attempt")
}

/// The catalog, one workflow per [`IssueType`].
pub fn builtin_workflows() -> Vec<Workflow> {
    use IssueType::*;

    IssueType::ALL
        .iter()
        .map(|&issue| {
            let actions = match issue {
                // infrastructure
                Timeout => vec![
                    try_step("stop stuck process", "terminate_process", "no stuck process"),
                    step("extend timeout", "extend_timeout", "longer timeout requested"),
                    retry_stage(),
                ],
                HangingProcess => vec![
                    step("terminate process", "terminate_process", "process gone"),
                    retry_stage(),
                ],
                MemoryExhausted => vec![
                    try_step("free scratch space", "cleanup_temp_files", "temp files removed"),
                    step("reduce parallelism", "reduce_parallelism", "fewer concurrent stages"),
                    retry_stage(),
                ],
                DiskFull => vec![
                    step("free scratch space", "cleanup_temp_files", "temp files removed"),
                    step("verify writable", "check_writable", "directory accepts writes"),
                ],
                NetworkError => vec![
                    step("wait for network", "wait_for_network", "endpoint reachable"),
                    try_step("back off", "backoff_wait", "backoff elapsed"),
                    retry_stage(),
                ],
                ProcessCrash => vec![
                    try_step("stop remnants", "terminate_process", "no leftover process"),
                    step("ensure working dir", "ensure_working_dir", "working dir exists"),
                    retry_stage(),
                ],
                // code
                CompilationError => vec![
                    try_step("format code", "run_formatter", "code formatted"),
                    step("rebuild", "run_build", "build passes"),
                ],
                TestFailure => vec![
                    step("request fix", "request_rework", "rework queued with failure output"),
                    try_step("rerun tests", "run_tests", "tests pass"),
                    retry_stage(),
                ],
                SecurityVulnerability => vec![
                    step("rescan code", "security_scan", "no dangerous constructs"),
                ],
                LintingError => vec![
                    try_step("format code", "run_formatter", "code formatted"),
                    step("lint", "run_linter", "linter passes"),
                ],
                // dependency
                MissingDependency => vec![
                    step("install dependencies", "install_dependencies", "dependencies installed"),
                    retry_stage(),
                ],
                VersionConflict => vec![
                    step("resolve versions", "resolve_versions", "versions consistent"),
                    try_step("reinstall", "install_dependencies", "dependencies installed"),
                    retry_stage(),
                ],
                ImportError => vec![
                    try_step("install dependencies", "install_dependencies", "dependencies installed"),
                    step("rebuild", "run_build", "imports resolve"),
                ],
                // llm / provider
                LlmApiError => vec![
                    try_step("back off", "backoff_wait", "backoff elapsed"),
                    step("fail over", "switch_provider", "alternate provider selected"),
                ],
                LlmTimeout => vec![
                    step("shrink request", "reduce_request_size", "smaller request"),
                    retry_stage(),
                ],
                LlmRateLimit => vec![
                    step("honour rate limit", "backoff_wait", "rate window elapsed"),
                    retry_stage(),
                ],
                InvalidLlmResponse => vec![
                    try_step("check response", "validate_response", "response parses"),
                    retry_stage(),
                ],
                // pipeline stage
                ArchitectureInvalid => vec![
                    try_step("drop draft", "reset_stage_artifacts", "stale artifacts removed"),
                    step("request redesign", "request_rework", "rework queued"),
                ],
                CodeReviewFailed => vec![step(
                    "request changes",
                    "request_rework",
                    "review feedback queued",
                )],
                IntegrationConflict => vec![
                    try_step("rebuild", "run_build", "build passes"),
                    step("request merge fix", "request_rework", "rework queued"),
                ],
                ValidationFailed => vec![
                    try_step("rerun tests", "run_tests", "tests pass"),
                    step("request fix", "request_rework", "rework queued"),
                ],
                StageExecutionError => vec![
                    try_step("free scratch space", "cleanup_temp_files", "temp files removed"),
                    retry_stage(),
                ],
                // multi-agent
                ArbitrationDeadlock => vec![step(
                    "break tie",
                    "break_tie",
                    "deterministic tie-break selected",
                )],
                DeveloperConflict => vec![
                    step("serialize developers", "serialize_developers", "one developer at a time"),
                    retry_stage(),
                ],
                MessagingFailure => vec![
                    step("reset mailbox", "reset_mailbox", "mailbox empty"),
                    retry_stage(),
                ],
                // data
                InvalidCard => vec![step("validate card", "validate_card", "card well-formed")],
                CorruptedState => vec![
                    step("quarantine record", "quarantine_corrupt_record", "record parses or is set aside"),
                    step("ensure state dir", "ensure_state_dir", "state dir exists"),
                ],
                RetrievalFailure => vec![
                    try_step("back off", "backoff_wait", "backoff elapsed"),
                    retry_stage(),
                ],
                // system
                ZombieProcess => vec![
                    step("terminate process", "terminate_process", "process reaped"),
                    try_step("free scratch space", "cleanup_temp_files", "temp files removed"),
                    retry_stage(),
                ],
                FileLockTimeout => vec![
                    step("clear stale locks", "clear_stale_locks", "no unheld locks remain"),
                    retry_stage(),
                ],
                PermissionDenied => vec![
                    try_step("ensure working dir", "ensure_working_dir", "working dir exists"),
                    step("verify writable", "check_writable", "directory accepts writes"),
                ],
            };
            Workflow::new(issue, &format!("recover_{}", issue.as_str()), actions)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::HandlerRegistry;
    use std::collections::HashSet;

    #[test]
    fn test_one_workflow_per_issue() {
        let workflows = builtin_workflows();
        let issues: HashSet<_> = workflows.iter().map(|w| w.issue).collect();
        assert_eq!(workflows.len(), IssueType::ALL.len());
        assert_eq!(issues.len(), IssueType::ALL.len());
    }

    #[test]
    fn test_all_handlers_exist() {
        let registry = HandlerRegistry::with_builtins();
        for workflow in builtin_workflows() {
            assert!(!workflow.actions.is_empty());
            for action in &workflow.actions {
                assert!(
                    registry.contains(&action.handler),
                    "{} uses unknown handler {}",
                    workflow.name,
                    action.handler
                );
            }
        }
    }

    #[test]
    fn test_terminal_actions_are_not_best_effort() {
        for workflow in builtin_workflows() {
            let last = workflow.actions.last().unwrap();
            assert!(!last.best_effort, "{} ends best-effort", workflow.name);
        }
    }
}
