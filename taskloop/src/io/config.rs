//! Engine configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::backoff::BackoffPolicy;
use crate::core::classifier::{Classifier, RuleTables};

/// Default sentinel the agent prints when it believes all work is done.
pub const DEFAULT_COMPLETION_SIGNAL: &str = "<promise>COMPLETE</promise>";

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; CLI flags override them for a single invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskloopConfig {
    /// Model name passed to the agent.
    pub model: String,

    /// Iterations per `run` invocation; 0 means unlimited.
    pub max_iterations: u32,

    /// Literal the agent prints to claim completion (advisory only).
    pub completion_signal: String,

    /// Delete the checkpoint instead of writing a terminal one when all tasks finish.
    pub delete_checkpoint_on_complete: bool,

    /// Bytes of agent stdout/stderr kept in memory per invocation.
    pub agent_output_limit_bytes: usize,

    pub agent: AgentConfig,

    pub retry: RetryConfig,

    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and leading arguments; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Flag that precedes the model name.
    pub model_flag: String,
    /// Flag appended when running with `--verbose`.
    pub verbose_flag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub backoff_multiplier: u32,
    /// Retry `Unknown` classifications like transient ones.
    pub retry_unknown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Rule tables replacing the built-in ones (relative to the project root).
    pub rules_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model_flag: "--model".to_string(),
            verbose_flag: Some("--verbose".to_string()),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_secs: policy.base_delay.as_secs(),
            backoff_multiplier: policy.multiplier,
            retry_unknown: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            multiplier: self.backoff_multiplier,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules_path: Some(PathBuf::from(".taskloop/error_rules.toml")),
        }
    }
}

impl Default for TaskloopConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            max_iterations: 0,
            completion_signal: DEFAULT_COMPLETION_SIGNAL.to_string(),
            delete_checkpoint_on_complete: false,
            agent_output_limit_bytes: 1_000_000,
            agent: AgentConfig::default(),
            retry: RetryConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl TaskloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be >= 1"));
        }
        if self.retry.backoff_multiplier == 0 {
            return Err(anyhow!("retry.backoff_multiplier must be >= 1"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.completion_signal.trim().is_empty() {
            return Err(anyhow!("completion_signal must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TaskloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<TaskloopConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = TaskloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TaskloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TaskloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Build the error classifier, honouring a rules override file when present.
pub fn load_classifier(root: &Path, cfg: &ClassifierConfig) -> Result<Classifier> {
    let Some(rules_path) = &cfg.rules_path else {
        return Ok(Classifier::builtin());
    };
    let path = if rules_path.is_absolute() {
        rules_path.clone()
    } else {
        root.join(rules_path)
    };
    if !path.exists() {
        debug!(path = %path.display(), "no rules override, using built-in tables");
        return Ok(Classifier::builtin());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let tables =
        RuleTables::from_toml_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Classifier::new(&tables).with_context(|| format!("compile rules {}", path.display()))
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
