//! Map a failure message onto an issue type.
//!
//! A fixed, ordered rules table: the first matching pattern wins. More
//! specific rules come first (an LLM timeout is checked before a generic
//! timeout). Unmatched messages fall back to
//! [`IssueType::StageExecutionError`].

use pipewright_common::IssueType;
use regex::Regex;
use std::sync::LazyLock;

static RULES: LazyLock<Vec<(Regex, IssueType)>> = LazyLock::new(|| {
    use IssueType::*;
    let rules: &[(&str, IssueType)] = &[
        // provider
        (r"rate.?limit|too many requests|\b429\b", LlmRateLimit),
        (r"(llm|model|completion|provider|openai|anthropic).{0,40}(timed? ?out|timeout)", LlmTimeout),
        (r"(invalid|malformed|unparseable).{0,20}(llm |model )?(response|json|completion)", InvalidLlmResponse),
        (r"(llm|openai|anthropic|provider|\bapi\b).{0,20}(error|unavailable|overloaded)|\b50[023]\b", LlmApiError),
        // system
        (r"zombie|defunct", ZombieProcess),
        (r"lock.{0,20}(timeout|timed out|held)|could not acquire lock", FileLockTimeout),
        (r"permission denied|access denied|\beacces\b|operation not permitted", PermissionDenied),
        // data
        (r"corrupt|checksum mismatch|unexpected end of (file|input)", CorruptedState),
        (r"invalid card|card .{0,20}(missing|invalid)", InvalidCard),
        (r"retriev|vector store|embedding|knowledge base", RetrievalFailure),
        // multi-agent
        (r"deadlock|arbitration.{0,20}(tie|stuck)", ArbitrationDeadlock),
        (r"developer.{0,20}conflict|conflicting (solutions|developers)", DeveloperConflict),
        (r"message.{0,20}(bus|queue|broker|transport)|messaging", MessagingFailure),
        // dependency
        (r"no module named|cannot find module|unresolved import|importerror|modulenotfound", ImportError),
        (r"version conflict|incompatible version|conflicting dependencies|resolutionimpossible", VersionConflict),
        (r"missing dependency|package .{0,40}not found|not installed|command not found", MissingDependency),
        // code
        (r"security|vulnerab|unsafe code|blocked by security scan", SecurityVulnerability),
        (r"syntaxerror|compil|build failed|error\[e\d+\]", CompilationError),
        (r"lint|clippy|flake8|eslint|pylint", LintingError),
        (r"tests? failed|assertion|assertionerror|failing tests?", TestFailure),
        // pipeline stage
        (r"architecture|design (invalid|rejected)", ArchitectureInvalid),
        (r"review (failed|rejected)|changes requested", CodeReviewFailed),
        (r"merge conflict|integration (failed|conflict)", IntegrationConflict),
        (r"validation (failed|error)", ValidationFailed),
        // infrastructure
        (r"out of memory|\boom\b|memoryerror|cannot allocate", MemoryExhausted),
        (r"no space left|disk (full|quota)", DiskFull),
        (r"\bhang|\bhung\b|unresponsive|no output for", HangingProcess),
        (r"timed? ?out|timeout|deadline exceeded", Timeout),
        (r"connection (refused|reset|closed)|network|dns|unreachable|econn", NetworkError),
        (r"segfault|segmentation fault|core dumped|killed by signal|crash", ProcessCrash),
    ];
    rules
        .iter()
        .map(|(pattern, issue)| (Regex::new(&format!("(?i){}", pattern)).unwrap(), *issue))
        .collect()
});

/// Classify an error message.
pub fn classify(message: &str) -> IssueType {
    RULES
        .iter()
        .find(|(regex, _)| regex.is_match(message))
        .map(|(_, issue)| *issue)
        .unwrap_or(IssueType::StageExecutionError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_before_generic() {
        assert_eq!(classify("OpenAI request timed out"), IssueType::LlmTimeout);
        assert_eq!(classify("stage timed out after 30s"), IssueType::Timeout);
        assert_eq!(classify("HTTP 429 Too Many Requests"), IssueType::LlmRateLimit);
    }

    #[test]
    fn test_categories() {
        assert_eq!(classify("ModuleNotFoundError: No module named 'foo'"), IssueType::ImportError);
        assert_eq!(classify("OSError: [Errno 28] No space left on device"), IssueType::DiskFull);
        assert_eq!(classify("3 tests failed"), IssueType::TestFailure);
        assert_eq!(classify("Permission denied: /etc/x"), IssueType::PermissionDenied);
        assert_eq!(classify("record is corrupt"), IssueType::CorruptedState);
        assert_eq!(classify("merge conflict in src/lib.rs"), IssueType::IntegrationConflict);
        assert_eq!(classify("Connection refused"), IssueType::NetworkError);
        assert_eq!(classify("SyntaxError: invalid syntax"), IssueType::CompilationError);
    }

    #[test]
    fn test_fallback() {
        assert_eq!(classify("boom"), IssueType::StageExecutionError);
        assert_eq!(classify(""), IssueType::StageExecutionError);
    }

    #[test]
    fn test_deterministic() {
        for msg in ["x", "timeout", "rate limit", "lint errors"] {
            assert_eq!(classify(msg), classify(msg));
        }
    }
}
