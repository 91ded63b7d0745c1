//! Driver configuration stored in `autopilot.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::classifier::DEFAULT_DEBOUNCE;
use crate::core::context::{DEFAULT_CONTEXT_CAPACITY, DEFAULT_SNIPPET_CHARS};
use crate::core::patterns::PatternSet;
use crate::core::resilience::ResiliencePolicy;
use crate::core::screen::DEFAULT_MAX_BYTES;
use crate::error::DriverError;
use crate::io::checks::CheckCommand;
use crate::io::submit::SubmissionConfig;

pub const DEFAULT_CONFIG_FILE: &str = "autopilot.toml";

/// Driver configuration (TOML).
///
/// Every section defaults, so an empty or missing file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Optional pattern set TOML; the built-in set is used when unset.
    pub patterns_path: Option<PathBuf>,
    pub session: SessionConfig,
    pub submission: SubmissionConfig,
    pub resilience: ResiliencePolicy,
    pub health: HealthConfig,
    pub dispatch: DispatchConfig,
    pub recovery: RecoveryConfig,
    /// Check id -> command.
    pub checks: BTreeMap<String, CheckCommand>,
}

/// How to launch and drive one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Appended to `args` when the session starts with the permission prompt skipped.
    pub skip_permissions_flag: String,
    pub skip_permission_prompt: bool,
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    pub startup_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub max_screen_bytes: usize,
    /// `is_healthy` turns false when busy this long without output.
    pub max_busy_without_output_ms: u64,
    /// Wait between the interrupt and the kill on stop.
    pub stop_grace_ms: u64,
    pub auto_approve_permissions: bool,
    pub approval_keys: String,
    pub context_capacity: usize,
    pub snippet_chars: usize,
    /// Characters of the stripped screen returned as a response.
    pub response_tail_chars: usize,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: Vec::new(),
            skip_permissions_flag: "--dangerously-skip-permissions".to_string(),
            skip_permission_prompt: true,
            cwd: None,
            rows: 50,
            cols: 200,
            startup_timeout_ms: 30_000,
            response_timeout_ms: 10 * 60 * 1000,
            poll_interval_ms: 500,
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            max_screen_bytes: DEFAULT_MAX_BYTES,
            max_busy_without_output_ms: 5 * 60 * 1000,
            stop_grace_ms: 2_000,
            auto_approve_permissions: false,
            approval_keys: "\r".to_string(),
            context_capacity: DEFAULT_CONTEXT_CAPACITY,
            snippet_chars: DEFAULT_SNIPPET_CHARS,
            response_tail_chars: 4_000,
            env: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_busy_without_output(&self) -> Duration {
        Duration::from_millis(self.max_busy_without_output_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    /// Busy this long with no screen growth counts as stuck.
    pub stuck_after_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stuck_after_ms: 5 * 60 * 1000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_millis(self.stuck_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub iteration_delay_ms: u64,
    /// Characters of an error message stored on the task.
    pub error_message_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            iteration_delay_ms: 1_000,
            error_message_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Send the continuation prompt after a restart that preserved context.
    pub prime_after_restart: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            prime_after_restart: true,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        let session = &self.session;
        if session.program.trim().is_empty() {
            return Err(invalid("session.program must not be empty"));
        }
        if session.startup_timeout_ms == 0 {
            return Err(invalid("session.startup_timeout_ms must be > 0"));
        }
        if session.response_timeout_ms == 0 {
            return Err(invalid("session.response_timeout_ms must be > 0"));
        }
        if session.poll_interval_ms == 0 {
            return Err(invalid("session.poll_interval_ms must be > 0"));
        }
        if session.max_screen_bytes < 1024 {
            return Err(invalid("session.max_screen_bytes must be >= 1024"));
        }
        if session.rows == 0 || session.cols == 0 {
            return Err(invalid("session.rows and session.cols must be > 0"));
        }
        if session.auto_approve_permissions && session.approval_keys.is_empty() {
            return Err(invalid(
                "session.approval_keys must be set when auto_approve_permissions is on",
            ));
        }
        if self.health.interval_ms == 0 {
            return Err(invalid("health.interval_ms must be > 0"));
        }
        if self.dispatch.error_message_limit < 4 {
            return Err(invalid("dispatch.error_message_limit must be >= 4"));
        }
        for (id, check) in &self.checks {
            if check.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(invalid(&format!("checks.{id}.command must be a non-empty array")));
            }
        }
        self.submission.validate()?;
        self.resilience.validate()?;
        Ok(())
    }
}

fn invalid(message: &str) -> DriverError {
    DriverError::Configuration(message.to_string())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// The configured pattern set, or the built-in one.
pub fn load_pattern_set(cfg: &AutopilotConfig) -> Result<PatternSet> {
    let Some(path) = &cfg.patterns_path else {
        return Ok(PatternSet::default());
    };
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read pattern set {}", path.display()))?;
    let set: PatternSet = toml::from_str(&contents)
        .with_context(|| format!("parse pattern set {}", path.display()))?;
    // Surface regex errors at load time rather than at first use.
    set.compile()
        .with_context(|| format!("compile pattern set {}", path.display()))?;
    Ok(set)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
