//! Remediation handlers and the registry that dispatches to them by name.
//!
//! Handlers are async. Commands run through `sh -c` under a timeout and
//! network checks use a bounded TCP connect. Handlers that cannot act on the
//! machine directly (provider failover, parallelism limits) pass hints back
//! through [`HandlerOutcome::updates`].

use super::RecoveryContext;
use crate::store::FileStore;
use crate::supervisor::sandbox::scan_code;
use async_trait::async_trait;
use fs2::FileExt;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Upper bound on any handler-initiated wait.
const MAX_WAIT: Duration = Duration::from_secs(30);
/// Wall-clock limit for remediation commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerCategory {
    ProcessControl,
    Filesystem,
    Network,
    CodeQuality,
    Dependency,
    ProviderFailover,
    StageRepair,
    MultiAgent,
    DataIntegrity,
    ResourceCleanup,
}

impl HandlerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessControl => "process_control",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::CodeQuality => "code_quality",
            Self::Dependency => "dependency",
            Self::ProviderFailover => "provider_failover",
            Self::StageRepair => "stage_repair",
            Self::MultiAgent => "multi_agent",
            Self::DataIntegrity => "data_integrity",
            Self::ResourceCleanup => "resource_cleanup",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub success: bool,
    pub details: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, String>,
}

impl HandlerOutcome {
    pub fn ok(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            updates: BTreeMap::new(),
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
            updates: BTreeMap::new(),
        }
    }

    pub fn with_update(mut self, key: &str, value: &str) -> Self {
        self.updates.insert(key.to_string(), value.to_string());
        self
    }
}

/// Uniform remediation contract.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> HandlerCategory;
    async fn handle(&self, context: &RecoveryContext) -> HandlerOutcome;
}

/// Name-keyed handler registry.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RecoveryHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in handler.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for name in BUILTIN_HANDLERS {
            if let Some(handler) = builtin_handler(name) {
                registry.register(handler);
            }
        }
        registry
    }

    /// Add or replace a handler under its own name.
    pub fn register(&mut self, handler: Arc<dyn RecoveryHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RecoveryHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handler backed by a plain function that returns immediately.
pub struct FnHandler {
    name: &'static str,
    category: HandlerCategory,
    run: fn(&RecoveryContext) -> HandlerOutcome,
}

#[async_trait]
impl RecoveryHandler for FnHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn category(&self) -> HandlerCategory {
        self.category
    }

    async fn handle(&self, context: &RecoveryContext) -> HandlerOutcome {
        (self.run)(context)
    }
}

type WaitingFn = for<'a> fn(&'a RecoveryContext) -> BoxFuture<'a, HandlerOutcome>;

/// Handler backed by a function that waits on a process, a socket or a timer.
pub struct WaitingHandler {
    name: &'static str,
    category: HandlerCategory,
    run: WaitingFn,
}

#[async_trait]
impl RecoveryHandler for WaitingHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn category(&self) -> HandlerCategory {
        self.category
    }

    async fn handle(&self, context: &RecoveryContext) -> HandlerOutcome {
        (self.run)(context).await
    }
}

/// Runs a command taken from context metadata in the working directory.
///
/// The command line is read from `metadata[key]`; a missing command is a
/// failure so the workflow can surface it.
pub struct CommandHandler {
    name: &'static str,
    category: HandlerCategory,
    key: &'static str,
}

#[async_trait]
impl RecoveryHandler for CommandHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn category(&self) -> HandlerCategory {
        self.category
    }

    async fn handle(&self, context: &RecoveryContext) -> HandlerOutcome {
        let Some(command_line) = context.meta(self.key) else {
            return HandlerOutcome::failure(format!("No {} configured", self.key));
        };
        let Some(dir) = context.working_dir.as_deref() else {
            return HandlerOutcome::failure("No working directory to run in");
        };
        run_command(command_line, dir).await
    }
}

/// Every built-in handler name, in registry order.
pub const BUILTIN_HANDLERS: &[&str] = &[
    "terminate_process",
    "restart_stage",
    "extend_timeout",
    "ensure_working_dir",
    "ensure_state_dir",
    "check_writable",
    "clear_stale_locks",
    "wait_for_network",
    "backoff_wait",
    "run_formatter",
    "run_linter",
    "run_build",
    "run_tests",
    "security_scan",
    "install_dependencies",
    "resolve_versions",
    "switch_provider",
    "reduce_request_size",
    "validate_response",
    "request_rework",
    "reset_stage_artifacts",
    "break_tie",
    "serialize_developers",
    "reset_mailbox",
    "validate_card",
    "quarantine_corrupt_record",
    "cleanup_temp_files",
    "reduce_parallelism",
];

fn fn_handler(
    name: &'static str,
    category: HandlerCategory,
    run: fn(&RecoveryContext) -> HandlerOutcome,
) -> Arc<dyn RecoveryHandler> {
    Arc::new(FnHandler {
        name,
        category,
        run,
    })
}

fn waiting_handler(name: &'static str, category: HandlerCategory, run: WaitingFn) -> Arc<dyn RecoveryHandler> {
    Arc::new(WaitingHandler {
        name,
        category,
        run,
    })
}

fn command_handler(name: &'static str, category: HandlerCategory, key: &'static str) -> Arc<dyn RecoveryHandler> {
    Arc::new(CommandHandler {
        name,
        category,
        key,
    })
}

/// Build a built-in handler by name.
pub fn builtin_handler(name: &str) -> Option<Arc<dyn RecoveryHandler>> {
    use HandlerCategory::*;

    let handler = match name {
        "terminate_process" => waiting_handler("terminate_process", ProcessControl, terminate_process),
        "restart_stage" => fn_handler("restart_stage", ProcessControl, restart_stage),
        "extend_timeout" => fn_handler("extend_timeout", ProcessControl, extend_timeout),
        "ensure_working_dir" => fn_handler("ensure_working_dir", Filesystem, ensure_working_dir),
        "ensure_state_dir" => fn_handler("ensure_state_dir", Filesystem, ensure_state_dir),
        "check_writable" => fn_handler("check_writable", Filesystem, check_writable),
        "clear_stale_locks" => fn_handler("clear_stale_locks", Filesystem, clear_stale_locks),
        "wait_for_network" => waiting_handler("wait_for_network", Network, wait_for_network),
        "backoff_wait" => waiting_handler("backoff_wait", Network, backoff_wait),
        "run_formatter" => command_handler("run_formatter", CodeQuality, "format_command"),
        "run_linter" => command_handler("run_linter", CodeQuality, "lint_command"),
        "run_build" => command_handler("run_build", CodeQuality, "build_command"),
        "run_tests" => command_handler("run_tests", CodeQuality, "test_command"),
        "security_scan" => fn_handler("security_scan", CodeQuality, security_scan),
        "install_dependencies" => command_handler("install_dependencies", Dependency, "install_command"),
        "resolve_versions" => command_handler("resolve_versions", Dependency, "resolve_command"),
        "switch_provider" => fn_handler("switch_provider", ProviderFailover, switch_provider),
        "reduce_request_size" => fn_handler("reduce_request_size", ProviderFailover, reduce_request_size),
        "validate_response" => fn_handler("validate_response", ProviderFailover, validate_response),
        "request_rework" => fn_handler("request_rework", StageRepair, request_rework),
        "reset_stage_artifacts" => fn_handler("reset_stage_artifacts", StageRepair, reset_stage_artifacts),
        "break_tie" => fn_handler("break_tie", MultiAgent, break_tie),
        "serialize_developers" => fn_handler("serialize_developers", MultiAgent, serialize_developers),
        "reset_mailbox" => fn_handler("reset_mailbox", MultiAgent, reset_mailbox),
        "validate_card" => fn_handler("validate_card", DataIntegrity, validate_card),
        "quarantine_corrupt_record" => {
            fn_handler("quarantine_corrupt_record", DataIntegrity, quarantine_corrupt_record)
        }
        "cleanup_temp_files" => fn_handler("cleanup_temp_files", ResourceCleanup, cleanup_temp_files),
        "reduce_parallelism" => fn_handler("reduce_parallelism", ResourceCleanup, reduce_parallelism),
        _ => return None,
    };
    Some(handler)
}

// --- process control ---

fn terminate_process(ctx: &RecoveryContext) -> BoxFuture<'_, HandlerOutcome> {
    async move {
        let Some(pid) = ctx.meta("pid") else {
            return HandlerOutcome::ok("No process recorded; nothing to terminate");
        };
        let Ok(pid) = pid.parse::<u32>() else {
            return HandlerOutcome::failure(format!("Invalid pid '{}'", pid));
        };
        let mut kill = Command::new("kill");
        kill.arg("-TERM")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match timeout(MAX_WAIT, kill.status()).await {
            Ok(Ok(status)) if status.success() => {
                HandlerOutcome::ok(format!("Sent SIGTERM to {}", pid))
            }
            Ok(Ok(_)) => HandlerOutcome::ok(format!("Process {} is not running", pid)),
            Ok(Err(e)) => HandlerOutcome::failure(format!("Failed to signal {}: {}", pid, e)),
            Err(_) => HandlerOutcome::failure(format!("Signalling {} timed out", pid)),
        }
    }
    .boxed()
}

fn restart_stage(ctx: &RecoveryContext) -> HandlerOutcome {
    match ctx.stage.as_deref() {
        Some(stage) => HandlerOutcome::ok(format!("Stage '{}' will be re-invoked", stage))
            .with_update("retry_stage", stage),
        None => HandlerOutcome::failure("No stage to restart"),
    }
}

fn extend_timeout(_ctx: &RecoveryContext) -> HandlerOutcome {
    HandlerOutcome::ok("Requested a longer stage timeout").with_update("timeout_multiplier", "2")
}

// --- filesystem ---

fn ensure_dir(dir: Option<&Path>, what: &str) -> HandlerOutcome {
    let Some(dir) = dir else {
        return HandlerOutcome::ok(format!("No {} configured", what));
    };
    match fs::create_dir_all(dir) {
        Ok(()) => HandlerOutcome::ok(format!("{} {} exists", what, dir.display())),
        Err(e) => HandlerOutcome::failure(format!("Cannot create {}: {}", dir.display(), e)),
    }
}

fn ensure_working_dir(ctx: &RecoveryContext) -> HandlerOutcome {
    ensure_dir(ctx.working_dir.as_deref(), "working directory")
}

fn ensure_state_dir(ctx: &RecoveryContext) -> HandlerOutcome {
    ensure_dir(ctx.state_dir.as_deref(), "state directory")
}

fn check_writable(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(dir) = ctx.working_dir.as_deref().or(ctx.state_dir.as_deref()) else {
        return HandlerOutcome::failure("No directory to check");
    };
    match tempfile::NamedTempFile::new_in(dir) {
        Ok(_) => HandlerOutcome::ok(format!("{} is writable", dir.display())),
        Err(e) => HandlerOutcome::failure(format!("{} is not writable: {}", dir.display(), e)),
    }
}

/// Remove orphaned lock files nobody currently holds.
///
/// A lock sitting next to its `.json` record belongs to the store and is
/// never unlinked: a writer that opened it before the unlink would lock an
/// inode the next writer can no longer see.
fn clear_stale_locks(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(dir) = ctx.state_dir.as_deref() else {
        return HandlerOutcome::ok("No state directory configured");
    };
    let mut removed = 0;
    let mut kept = 0;
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().map(|e| e != "lock").unwrap_or(true) {
            continue;
        }
        if path.with_extension("json").exists() {
            kept += 1;
            continue;
        }
        let Ok(file) = fs::OpenOptions::new().write(true).open(path) else {
            continue;
        };
        if file.try_lock_exclusive().is_ok() {
            let _ = file.unlock();
            if fs::remove_file(path).is_ok() {
                removed += 1;
            }
        }
    }
    HandlerOutcome::ok(format!(
        "Removed {} stale lock file(s), kept {} record lock(s)",
        removed, kept
    ))
}

// --- network ---

fn wait_for_network(ctx: &RecoveryContext) -> BoxFuture<'_, HandlerOutcome> {
    async move {
        let Some(endpoint) = ctx.meta("endpoint") else {
            return HandlerOutcome::ok("No endpoint to check");
        };
        for attempt in 1..=CONNECT_ATTEMPTS {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await {
                Ok(Ok(_)) => {
                    return HandlerOutcome::ok(format!(
                        "{} reachable (attempt {})",
                        endpoint, attempt
                    ));
                }
                Ok(Err(e)) => debug!(%endpoint, attempt, error = %e, "Connect failed"),
                Err(_) => debug!(%endpoint, attempt, "Connect timed out"),
            }
            if attempt < CONNECT_ATTEMPTS {
                sleep(Duration::from_secs(1)).await;
            }
        }
        HandlerOutcome::failure(format!("{} unreachable", endpoint))
    }
    .boxed()
}

/// Sleep for `retry_after` seconds if given, otherwise a short delay that
/// grows with the attempt number.
fn backoff_wait(ctx: &RecoveryContext) -> BoxFuture<'_, HandlerOutcome> {
    async move {
        let seconds = ctx
            .meta("retry_after")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|s| s.is_finite())
            .unwrap_or_else(|| 0.1 * 2f64.powi(ctx.attempt.min(8) as i32));
        let wait = Duration::from_secs_f64(seconds.max(0.0)).min(MAX_WAIT);
        sleep(wait).await;
        HandlerOutcome::ok(format!("Waited {:.1}s", wait.as_secs_f64()))
    }
    .boxed()
}

// --- code quality ---

const SCANNED_EXTENSIONS: &[&str] = &["py", "sh", "js", "ts", "rb", "rs"];

fn security_scan(ctx: &RecoveryContext) -> HandlerOutcome {
    let mut hits = Vec::new();
    if let Some(code) = ctx.meta("code") {
        hits.extend(scan_code(code).into_iter().map(|f| format!("line {}: {}", f.line, f.pattern)));
    } else if let Some(dir) = ctx.working_dir.as_deref() {
        for entry in WalkDir::new(dir)
            .max_depth(8)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let scanned = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| SCANNED_EXTENSIONS.contains(&e))
                .unwrap_or(false);
            if !scanned {
                continue;
            }
            if let Ok(code) = fs::read_to_string(path) {
                hits.extend(
                    scan_code(&code)
                        .into_iter()
                        .map(|f| format!("{}:{}: {}", path.display(), f.line, f.pattern)),
                );
            }
        }
    } else {
        return HandlerOutcome::failure("No code or working directory to scan");
    }

    if hits.is_empty() {
        HandlerOutcome::ok("Security scan clean")
    } else {
        HandlerOutcome::failure(format!("Security scan found: {}", hits.join("; ")))
    }
}

/// Run a command line through the shell, so quoting and pipes behave the
/// way they do in a terminal. The child is killed if the timeout fires.
async fn run_command(command_line: &str, dir: &Path) -> HandlerOutcome {
    run_command_with_timeout(command_line, dir, COMMAND_TIMEOUT).await
}

async fn run_command_with_timeout(command_line: &str, dir: &Path, limit: Duration) -> HandlerOutcome {
    if command_line.trim().is_empty() {
        return HandlerOutcome::failure("Empty command");
    }
    let child = match Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return HandlerOutcome::failure(format!("Failed to run '{}': {}", command_line, e)),
    };

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => {
            HandlerOutcome::ok(format!("'{}' succeeded", command_line))
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            HandlerOutcome::failure(format!(
                "'{}' exited with {} {}",
                command_line,
                output.status,
                last_line.trim()
            ))
        }
        Ok(Err(e)) => HandlerOutcome::failure(format!("Failed to wait on '{}': {}", command_line, e)),
        Err(_) => {
            warn!(command = %command_line, timeout_secs = limit.as_secs_f64(), "Remediation command timed out");
            HandlerOutcome::failure(format!("'{}' timed out", command_line))
        }
    }
}

// --- provider failover ---

fn switch_provider(ctx: &RecoveryContext) -> HandlerOutcome {
    let current = ctx.meta("provider").unwrap_or_default();
    let next = ctx
        .meta("fallback_providers")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .find(|p| !p.is_empty() && *p != current);
    match next {
        Some(provider) => HandlerOutcome::ok(format!("Failing over to {}", provider))
            .with_update("provider", provider),
        None => HandlerOutcome::failure("No fallback provider available"),
    }
}

fn reduce_request_size(ctx: &RecoveryContext) -> HandlerOutcome {
    let current = ctx
        .meta("max_tokens")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(4096);
    let reduced = (current / 2).max(256);
    HandlerOutcome::ok(format!("Reduced max_tokens {} -> {}", current, reduced))
        .with_update("max_tokens", &reduced.to_string())
}

fn validate_response(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(response) = ctx.meta("response") else {
        return HandlerOutcome::failure("No response captured");
    };
    match serde_json::from_str::<serde_json::Value>(response) {
        Ok(_) => HandlerOutcome::ok("Response is well-formed JSON"),
        Err(e) => HandlerOutcome::failure(format!("Malformed response: {}", e)),
    }
}

// --- stage repair ---

fn request_rework(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(stage) = ctx.stage.as_deref() else {
        return HandlerOutcome::failure("No stage to rework");
    };
    let mut outcome = HandlerOutcome::ok(format!("Rework requested for '{}'", stage))
        .with_update("rework_stage", stage);
    if let Some(error) = ctx.error.as_deref() {
        outcome = outcome.with_update("feedback", error);
    }
    outcome
}

/// Remove `<working_dir>/<stage>` so the stage regenerates from scratch.
fn reset_stage_artifacts(ctx: &RecoveryContext) -> HandlerOutcome {
    let (Some(dir), Some(stage)) = (ctx.working_dir.as_deref(), ctx.stage.as_deref()) else {
        return HandlerOutcome::ok("No stage artifacts to reset");
    };
    let plain = !stage.is_empty()
        && stage
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !plain {
        return HandlerOutcome::failure(format!("Refusing to reset artifacts for stage '{}'", stage));
    }
    let target = dir.join(stage);
    if !target.exists() {
        return HandlerOutcome::ok(format!("No artifacts at {}", target.display()));
    }
    match fs::remove_dir_all(&target) {
        Ok(()) => HandlerOutcome::ok(format!("Removed {}", target.display())),
        Err(e) => HandlerOutcome::failure(format!("Cannot remove {}: {}", target.display(), e)),
    }
}

// --- multi-agent ---

fn break_tie(_ctx: &RecoveryContext) -> HandlerOutcome {
    HandlerOutcome::ok("Arbitration falls back to candidate id ordering")
        .with_update("tie_break", "lowest_candidate_id")
}

fn serialize_developers(_ctx: &RecoveryContext) -> HandlerOutcome {
    HandlerOutcome::ok("Developers will run one at a time").with_update("parallel_developers", "1")
}

fn reset_mailbox(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(dir) = ctx.meta("mailbox_dir") else {
        return HandlerOutcome::ok("No mailbox configured");
    };
    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    HandlerOutcome::ok(format!("Cleared {} pending message(s)", removed))
}

// --- data integrity ---

fn validate_card(ctx: &RecoveryContext) -> HandlerOutcome {
    if ctx.card_id.trim().is_empty() {
        return HandlerOutcome::failure("Card has no id");
    }
    if ctx.meta("card_title").map(|t| t.trim().is_empty()).unwrap_or(false) {
        return HandlerOutcome::failure("Card has an empty title");
    }
    HandlerOutcome::ok("Card is valid")
}

/// Move an unparseable record aside so the next run starts fresh.
fn quarantine_corrupt_record(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(dir) = ctx.state_dir.as_deref() else {
        return HandlerOutcome::ok("No state directory configured");
    };
    let path = FileStore::new(dir).record_path(&ctx.card_id);
    let Ok(content) = fs::read_to_string(&path) else {
        return HandlerOutcome::ok("No record on disk");
    };
    if serde_json::from_str::<serde_json::Value>(&content).is_ok() {
        return HandlerOutcome::ok("Record is valid JSON");
    }
    let aside = path.with_extension(format!(
        "json.corrupt-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S")
    ));
    match fs::rename(&path, &aside) {
        Ok(()) => {
            warn!(record = %aside.display(), "Quarantined corrupt record");
            HandlerOutcome::ok(format!("Moved corrupt record to {}", aside.display()))
        }
        Err(e) => HandlerOutcome::failure(format!("Cannot quarantine {}: {}", path.display(), e)),
    }
}

// --- resource cleanup ---

const TEMP_EXTENSIONS: &[&str] = &["tmp", "pyc"];

fn cleanup_temp_files(ctx: &RecoveryContext) -> HandlerOutcome {
    let Some(dir) = ctx.working_dir.as_deref() else {
        return HandlerOutcome::ok("No working directory configured");
    };
    let mut removed = 0u64;
    let mut freed = 0u64;
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let is_temp = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| TEMP_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !is_temp {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if fs::remove_file(entry.path()).is_ok() {
            removed += 1;
            freed += size;
        }
    }
    debug!(removed, freed, "Cleaned temporary files");
    HandlerOutcome::ok(format!("Removed {} file(s), freed {} bytes", removed, freed))
}

fn reduce_parallelism(_ctx: &RecoveryContext) -> HandlerOutcome {
    HandlerOutcome::ok("Parallelism reduced").with_update("max_parallel", "1")
}
