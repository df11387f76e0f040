//! Unified configuration for pipewright.
//!
//! Reads `.pipewright/pipewright.toml` and layers environment overrides on
//! top. Every field has a default, so a missing file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! state_dir = ".pipewright/state"
//! max_parallel = 4
//! circuit_reset_seconds = 60.0
//!
//! [supervisor.default]
//! max_retries = 3
//! retry_delay_seconds = 1.0
//! backoff_multiplier = 2.0
//! circuit_breaker_threshold = 5
//! timeout_seconds = 300.0
//!
//! [supervisor.overrides."development*"]
//! max_retries = 5
//! timeout_seconds = 900.0
//!
//! [cost]
//! enabled = true
//! daily_budget = 25.0
//! monthly_budget = 400.0
//!
//! [[cost.rates]]
//! provider = "openai"
//! model = "gpt-4o"
//! input_per_1k = 0.0025
//! output_per_1k = 0.01
//!
//! [sandbox]
//! enabled = true
//! interpreter = ["python3"]
//! timeout_seconds = 30
//!
//! [arbitration]
//! high_margin = 15.0
//! low_margin = 5.0
//! ```

use crate::arbiter::ArbitrationConfig;
use crate::supervisor::RecoveryStrategy;
use crate::supervisor::cost::CostConfig;
use crate::supervisor::sandbox::SandboxConfig;
use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = ".pipewright";
pub const CONFIG_FILE: &str = "pipewright.toml";

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Directory holding one durable record per card. Relative paths resolve
    /// against the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Bound on concurrently executing stages in the parallel strategy
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Seconds an open circuit waits before allowing a half-open trial call
    #[serde(default = "default_circuit_reset_seconds")]
    pub circuit_reset_seconds: f64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_circuit_reset_seconds() -> f64 {
    60.0
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            state_dir: None,
            max_parallel: default_max_parallel(),
            circuit_reset_seconds: default_circuit_reset_seconds(),
        }
    }
}

/// Partial recovery strategy applied to stages whose name matches a pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyOverride {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_seconds: Option<f64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

impl StrategyOverride {
    fn apply(&self, strategy: &mut RecoveryStrategy) {
        if let Some(v) = self.max_retries {
            strategy.max_retries = v;
        }
        if let Some(v) = self.retry_delay_seconds {
            strategy.retry_delay_seconds = v;
        }
        if let Some(v) = self.backoff_multiplier {
            strategy.backoff_multiplier = v;
        }
        if let Some(v) = self.circuit_breaker_threshold {
            strategy.circuit_breaker_threshold = v;
        }
        if let Some(v) = self.timeout_seconds {
            strategy.timeout_seconds = v;
        }
    }
}

/// Supervisor settings: the default strategy plus per-stage overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default)]
    pub default: RecoveryStrategy,
    /// Glob pattern (e.g. "development*") -> override. Applied in key order.
    #[serde(default)]
    pub overrides: BTreeMap<String, StrategyOverride>,
}

impl SupervisorSection {
    /// Resolve the effective recovery strategy for a stage name.
    pub fn strategy_for(&self, stage_name: &str) -> RecoveryStrategy {
        let mut strategy = self.default.clone();
        for (pattern, override_cfg) in &self.overrides {
            if pattern_matches(pattern, stage_name) {
                override_cfg.apply(&mut strategy);
            }
        }
        strategy
    }
}

/// The complete pipewright.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipewrightToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub arbitration: ArbitrationConfig,
}

impl PipewrightToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipewright.toml")
    }

    /// Load from `<config_dir>/pipewright.toml`, or defaults if absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipewright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from a key lookup (normally the process environment).
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PIPEWRIGHT_STATE_DIR") {
            self.engine.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(n) = lookup("PIPEWRIGHT_MAX_PARALLEL").and_then(|v| v.parse().ok()) {
            self.engine.max_parallel = n;
        }
        if let Some(b) = lookup("PIPEWRIGHT_DAILY_BUDGET").and_then(|v| v.parse().ok()) {
            self.cost.daily_budget = Some(b);
        }
        if let Some(b) = lookup("PIPEWRIGHT_MONTHLY_BUDGET").and_then(|v| v.parse().ok()) {
            self.cost.monthly_budget = Some(b);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_parallel == 0 {
            warnings.push("engine.max_parallel is 0; parallel batches cannot run".to_string());
        }
        if self.engine.circuit_reset_seconds <= 0.0 {
            warnings.push("engine.circuit_reset_seconds must be positive".to_string());
        }
        if let Err(message) = self.supervisor.default.validate() {
            warnings.push(format!("supervisor.default: {}", message));
        }
        for pattern in self.supervisor.overrides.keys() {
            if Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid override pattern '{}'", pattern));
            } else if let Err(message) = self.supervisor.strategy_for(pattern).validate() {
                warnings.push(format!("supervisor.overrides.\"{}\": {}", pattern, message));
            }
        }
        if self.sandbox.interpreter.is_empty() {
            warnings.push("sandbox.interpreter is empty".to_string());
        }
        if self.arbitration.low_margin > self.arbitration.high_margin {
            warnings.push(format!(
                "arbitration.low_margin ({}) exceeds high_margin ({})",
                self.arbitration.low_margin, self.arbitration.high_margin
            ));
        }
        warnings
    }
}

/// Check if a glob pattern matches a stage name (case-insensitive).
///
/// Invalid patterns never match.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    Pattern::new(pattern)
        .map(|p| p.matches_with(name, options))
        .unwrap_or(false)
}

/// Configuration resolved for a project directory: file, then environment.
#[derive(Debug, Clone)]
pub struct PipewrightConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: PipewrightToml,
}

impl PipewrightConfig {
    /// Load configuration for a project directory, applying environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = PipewrightToml::load_or_default(&config_dir)?;
        toml.apply_overrides(|key| std::env::var(key).ok());
        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    /// Build from an already-parsed file without touching the environment.
    pub fn from_toml(project_dir: PathBuf, toml: PipewrightToml) -> Self {
        let config_dir = project_dir.join(CONFIG_DIR);
        Self {
            project_dir,
            config_dir,
            toml,
        }
    }

    /// Directory holding per-card records.
    pub fn state_dir(&self) -> PathBuf {
        match &self.toml.engine.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => self.config_dir.join("state"),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.toml.engine.max_parallel.max(1)
    }

    pub fn strategy_for(&self, stage_name: &str) -> RecoveryStrategy {
        self.toml.supervisor.strategy_for(stage_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let toml = PipewrightToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.engine.max_parallel, 4);
        assert_eq!(toml.engine.circuit_reset_seconds, 60.0);
        assert_eq!(toml.supervisor.default.max_retries, 3);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = PipewrightToml::parse(
            r#"
[engine]
max_parallel = 2

[supervisor.default]
max_retries = 1
retry_delay_seconds = 0.5

[supervisor.overrides."dev*"]
max_retries = 6
timeout_seconds = 900.0

[cost]
daily_budget = 12.5

[[cost.rates]]
provider = "acme"
model = "large"
input_per_1k = 0.01
output_per_1k = 0.02

[sandbox]
interpreter = ["sh"]
timeout_seconds = 5

[arbitration]
high_margin = 20.0
"#,
        )
        .unwrap();

        assert_eq!(toml.engine.max_parallel, 2);
        assert_eq!(toml.cost.daily_budget, Some(12.5));
        assert_eq!(toml.cost.rates.len(), 1);
        assert_eq!(toml.sandbox.interpreter, vec!["sh"]);
        assert_eq!(toml.arbitration.high_margin, 20.0);

        let dev = toml.supervisor.strategy_for("Development");
        assert_eq!(dev.max_retries, 6);
        assert_eq!(dev.timeout_seconds, 900.0);
        assert_eq!(dev.retry_delay_seconds, 0.5);

        let review = toml.supervisor.strategy_for("review");
        assert_eq!(review.max_retries, 1);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(PipewrightToml::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("PIPEWRIGHT_STATE_DIR", "/var/lib/pw"),
            ("PIPEWRIGHT_MAX_PARALLEL", "8"),
            ("PIPEWRIGHT_DAILY_BUDGET", "3.5"),
            ("PIPEWRIGHT_MONTHLY_BUDGET", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut toml = PipewrightToml::default();
        toml.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(toml.engine.state_dir, Some(PathBuf::from("/var/lib/pw")));
        assert_eq!(toml.engine.max_parallel, 8);
        assert_eq!(toml.cost.daily_budget, Some(3.5));
        assert_eq!(toml.cost.monthly_budget, None);
    }

    #[test]
    fn test_state_dir_resolution() {
        let project = PathBuf::from("/work/project");
        let config = PipewrightConfig::from_toml(project.clone(), PipewrightToml::default());
        assert_eq!(config.state_dir(), project.join(".pipewright").join("state"));

        let mut toml = PipewrightToml::default();
        toml.engine.state_dir = Some(PathBuf::from("records"));
        let config = PipewrightConfig::from_toml(project.clone(), toml);
        assert_eq!(config.state_dir(), project.join("records"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut toml = PipewrightToml::default();
        toml.engine.max_parallel = 0;
        toml.supervisor.default.backoff_multiplier = 0.5;
        toml.arbitration.low_margin = 50.0;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3, "{:?}", warnings);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = PipewrightToml::default();
        toml.engine.max_parallel = 7;
        toml.save(&path).unwrap();

        let loaded = PipewrightToml::load(&path).unwrap();
        assert_eq!(loaded.engine.max_parallel, 7);
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("dev*", "development"));
        assert!(pattern_matches("*review", "code_review"));
        assert!(pattern_matches("TEST?ng", "testing"));
        assert!(!pattern_matches("dev*", "review"));
        assert!(!pattern_matches("[", "anything"));
    }
}
