//! Sandboxed execution of generated code.
//!
//! Code is statically scanned first; any hit on a dangerous pattern blocks
//! execution and is reported as `killed` with the matched pattern. Code that
//! passes runs in a fresh temporary directory with a cleared environment,
//! under a wall-clock timeout that kills the child.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

/// PATH handed to sandboxed children.
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Program and leading arguments; the script path is appended
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_script_name")]
    pub script_name: String,
}

fn default_enabled() -> bool {
    true
}

fn default_interpreter() -> Vec<String> {
    vec!["python3".to_string()]
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_script_name() -> String {
    "snippet.py".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interpreter: default_interpreter(),
            timeout_seconds: default_timeout_seconds(),
            max_output_bytes: default_max_output_bytes(),
            script_name: default_script_name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatClass {
    ShellExecution,
    FilesystemEscape,
    NetworkEgress,
}

impl ThreatClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShellExecution => "shell_execution",
            Self::FilesystemEscape => "filesystem_escape",
            Self::NetworkEgress => "network_egress",
        }
    }
}

struct ScanRule {
    class: ThreatClass,
    name: &'static str,
    regex: Regex,
}

fn rule(class: ThreatClass, name: &'static str, pattern: &str) -> ScanRule {
    ScanRule {
        class,
        name,
        regex: Regex::new(pattern).unwrap(),
    }
}

static SCAN_RULES: LazyLock<Vec<ScanRule>> = LazyLock::new(|| {
    use ThreatClass::*;
    vec![
        rule(ShellExecution, "os.system", r"\bos\.system\s*\("),
        rule(ShellExecution, "os.popen", r"\bos\.popen\s*\("),
        rule(ShellExecution, "os.exec", r"\bos\.exec[lv]p?e?\s*\("),
        rule(ShellExecution, "subprocess", r"\bsubprocess\b"),
        rule(ShellExecution, "eval", r"\beval\s*\("),
        rule(ShellExecution, "exec", r"\bexec\s*\("),
        rule(ShellExecution, "__import__", r"\b__import__\s*\("),
        rule(ShellExecution, "shell -c", r"\b(?:bash|sh|zsh)\s+-c\b"),
        rule(FilesystemEscape, "parent traversal", r"\.\./"),
        rule(FilesystemEscape, "shutil.rmtree", r"\bshutil\.rmtree\b"),
        rule(FilesystemEscape, "os.remove", r"\bos\.(?:remove|unlink|rmdir)\s*\("),
        rule(FilesystemEscape, "rm -r", r"\brm\s+-[a-zA-Z]*r"),
        rule(FilesystemEscape, "system file", r"/etc/(?:passwd|shadow|sudoers)"),
        rule(FilesystemEscape, "absolute open", r#"\bopen\s*\(\s*['"]/"#),
        rule(FilesystemEscape, "chmod", r"\bchmod\b"),
        rule(NetworkEgress, "socket", r"\bsocket\b"),
        rule(NetworkEgress, "requests", r"\brequests\.(?:get|post|put|patch|delete|request)\b"),
        rule(NetworkEgress, "urllib", r"\burllib\b"),
        rule(NetworkEgress, "http.client", r"\bhttp\.client\b"),
        rule(NetworkEgress, "download tool", r"\b(?:curl|wget|nc|ncat)\s"),
        rule(NetworkEgress, "url", r"\bhttps?://"),
    ]
});

/// A dangerous construct found by the static scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub class: ThreatClass,
    pub pattern: String,
    /// 1-based source line
    pub line: usize,
}

/// Scan code for dangerous operations. Findings are in source order.
pub fn scan_code(code: &str) -> Vec<ScanFinding> {
    let mut findings = Vec::new();
    for (idx, line) in code.lines().enumerate() {
        for rule in SCAN_RULES.iter() {
            if rule.regex.is_match(line) {
                findings.push(ScanFinding {
                    class: rule.class,
                    pattern: rule.name.to_string(),
                    line: idx + 1,
                });
            }
        }
    }
    findings
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub kill_reason: Option<String>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub findings: Vec<ScanFinding>,
}

impl ExecutionResult {
    fn blocked(findings: Vec<ScanFinding>) -> Self {
        let reason = findings
            .first()
            .map(|f| {
                format!(
                    "Blocked by security scan: {} ({}) on line {}",
                    f.pattern,
                    f.class.as_str(),
                    f.line
                )
            })
            .unwrap_or_else(|| "Blocked by security scan".to_string());
        Self {
            killed: true,
            kill_reason: Some(reason),
            findings,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub executions: u64,
    pub blocked: u64,
    pub timeouts: u64,
    pub failures: u64,
}

/// Isolated code execution capability injected into the supervisor.
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn execute(&self, code: &str, scan_security: bool) -> Result<ExecutionResult>;
    fn stats(&self) -> SandboxStats;
}

/// Runs code with a local interpreter in a throwaway directory.
pub struct ProcessSandbox {
    config: SandboxConfig,
    stats: Mutex<SandboxStats>,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(SandboxStats::default()),
        }
    }

    fn bump(&self, f: impl FnOnce(&mut SandboxStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    fn truncate(&self, bytes: &[u8]) -> String {
        let limit = self.config.max_output_bytes;
        if bytes.len() > limit {
            let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
            text.push_str("\n[output truncated]");
            text
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    async fn execute(&self, code: &str, scan_security: bool) -> Result<ExecutionResult> {
        if scan_security {
            let findings = scan_code(code);
            if !findings.is_empty() {
                let result = ExecutionResult::blocked(findings);
                warn!(reason = ?result.kill_reason, "Sandbox blocked code before execution");
                self.bump(|s| s.blocked += 1);
                return Ok(result);
            }
        }

        let Some((program, args)) = self.config.interpreter.split_first() else {
            anyhow::bail!("Sandbox interpreter is not configured");
        };

        let workdir = tempfile::tempdir().context("Failed to create sandbox directory")?;
        let script = workdir.path().join(&self.config.script_name);
        tokio::fs::write(&script, code)
            .await
            .context("Failed to write sandbox script")?;

        let child = Command::new(program)
            .args(args)
            .arg(&script)
            .current_dir(workdir.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn sandbox interpreter '{}'", program))?;

        self.bump(|s| s.executions += 1);
        let started = Instant::now();
        let limit = Duration::from_secs(self.config.timeout_seconds);

        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("Failed to collect sandbox output")?;
                let success = output.status.success();
                if !success {
                    self.bump(|s| s.failures += 1);
                }
                info!(
                    exit_code = ?output.status.code(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Sandbox execution finished"
                );
                Ok(ExecutionResult {
                    success,
                    stdout: self.truncate(&output.stdout),
                    stderr: self.truncate(&output.stderr),
                    exit_code: output.status.code(),
                    killed: false,
                    kill_reason: None,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    findings: Vec::new(),
                })
            }
            Err(_) => {
                // dropping the wait future kills the child (kill_on_drop)
                self.bump(|s| s.timeouts += 1);
                warn!(timeout_secs = self.config.timeout_seconds, "Sandbox execution timed out");
                Ok(ExecutionResult {
                    killed: true,
                    kill_reason: Some(format!(
                        "Timed out after {}s",
                        self.config.timeout_seconds
                    )),
                    duration_seconds: started.elapsed().as_secs_f64(),
                    ..ExecutionResult::default()
                })
            }
        }
    }

    fn stats(&self) -> SandboxStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
