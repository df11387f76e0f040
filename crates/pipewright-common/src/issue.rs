//! Closed taxonomy of failure conditions.
//!
//! Every [`IssueType`] belongs to exactly one [`IssueCategory`] and must be
//! backed by a registered remediation workflow at engine startup.

use crate::ParseEnumError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Infrastructure,
    Code,
    Dependency,
    LlmProvider,
    PipelineStage,
    MultiAgent,
    Data,
    System,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::Code => "code",
            Self::Dependency => "dependency",
            Self::LlmProvider => "llm_provider",
            Self::PipelineStage => "pipeline_stage",
            Self::MultiAgent => "multi_agent",
            Self::Data => "data",
            Self::System => "system",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    // Infrastructure
    Timeout,
    HangingProcess,
    MemoryExhausted,
    DiskFull,
    NetworkError,
    ProcessCrash,

    // Code
    CompilationError,
    TestFailure,
    SecurityVulnerability,
    LintingError,

    // Dependency
    MissingDependency,
    VersionConflict,
    ImportError,

    // LLM / provider
    LlmApiError,
    LlmTimeout,
    LlmRateLimit,
    InvalidLlmResponse,

    // Pipeline stage
    ArchitectureInvalid,
    CodeReviewFailed,
    IntegrationConflict,
    ValidationFailed,
    StageExecutionError,

    // Multi-agent
    ArbitrationDeadlock,
    DeveloperConflict,
    MessagingFailure,

    // Data
    InvalidCard,
    CorruptedState,
    RetrievalFailure,

    // System
    ZombieProcess,
    FileLockTimeout,
    PermissionDenied,
}

impl IssueType {
    pub const ALL: [IssueType; 31] = [
        Self::Timeout,
        Self::HangingProcess,
        Self::MemoryExhausted,
        Self::DiskFull,
        Self::NetworkError,
        Self::ProcessCrash,
        Self::CompilationError,
        Self::TestFailure,
        Self::SecurityVulnerability,
        Self::LintingError,
        Self::MissingDependency,
        Self::VersionConflict,
        Self::ImportError,
        Self::LlmApiError,
        Self::LlmTimeout,
        Self::LlmRateLimit,
        Self::InvalidLlmResponse,
        Self::ArchitectureInvalid,
        Self::CodeReviewFailed,
        Self::IntegrationConflict,
        Self::ValidationFailed,
        Self::StageExecutionError,
        Self::ArbitrationDeadlock,
        Self::DeveloperConflict,
        Self::MessagingFailure,
        Self::InvalidCard,
        Self::CorruptedState,
        Self::RetrievalFailure,
        Self::ZombieProcess,
        Self::FileLockTimeout,
        Self::PermissionDenied,
    ];

    pub fn category(&self) -> IssueCategory {
        match self {
            Self::Timeout
            | Self::HangingProcess
            | Self::MemoryExhausted
            | Self::DiskFull
            | Self::NetworkError
            | Self::ProcessCrash => IssueCategory::Infrastructure,
            Self::CompilationError
            | Self::TestFailure
            | Self::SecurityVulnerability
            | Self::LintingError => IssueCategory::Code,
            Self::MissingDependency | Self::VersionConflict | Self::ImportError => {
                IssueCategory::Dependency
            }
            Self::LlmApiError | Self::LlmTimeout | Self::LlmRateLimit | Self::InvalidLlmResponse => {
                IssueCategory::LlmProvider
            }
            Self::ArchitectureInvalid
            | Self::CodeReviewFailed
            | Self::IntegrationConflict
            | Self::ValidationFailed
            | Self::StageExecutionError => IssueCategory::PipelineStage,
            Self::ArbitrationDeadlock | Self::DeveloperConflict | Self::MessagingFailure => {
                IssueCategory::MultiAgent
            }
            Self::InvalidCard | Self::CorruptedState | Self::RetrievalFailure => IssueCategory::Data,
            Self::ZombieProcess | Self::FileLockTimeout | Self::PermissionDenied => {
                IssueCategory::System
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HangingProcess => "hanging_process",
            Self::MemoryExhausted => "memory_exhausted",
            Self::DiskFull => "disk_full",
            Self::NetworkError => "network_error",
            Self::ProcessCrash => "process_crash",
            Self::CompilationError => "compilation_error",
            Self::TestFailure => "test_failure",
            Self::SecurityVulnerability => "security_vulnerability",
            Self::LintingError => "linting_error",
            Self::MissingDependency => "missing_dependency",
            Self::VersionConflict => "version_conflict",
            Self::ImportError => "import_error",
            Self::LlmApiError => "llm_api_error",
            Self::LlmTimeout => "llm_timeout",
            Self::LlmRateLimit => "llm_rate_limit",
            Self::InvalidLlmResponse => "invalid_llm_response",
            Self::ArchitectureInvalid => "architecture_invalid",
            Self::CodeReviewFailed => "code_review_failed",
            Self::IntegrationConflict => "integration_conflict",
            Self::ValidationFailed => "validation_failed",
            Self::StageExecutionError => "stage_execution_error",
            Self::ArbitrationDeadlock => "arbitration_deadlock",
            Self::DeveloperConflict => "developer_conflict",
            Self::MessagingFailure => "messaging_failure",
            Self::InvalidCard => "invalid_card",
            Self::CorruptedState => "corrupted_state",
            Self::RetrievalFailure => "retrieval_failure",
            Self::ZombieProcess => "zombie_process",
            Self::FileLockTimeout => "file_lock_timeout",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|issue| issue.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("issue type", s))
    }
}
