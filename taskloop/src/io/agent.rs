//! Agent abstraction for units of work.
//!
//! The [`Agent`] trait decouples the build loop from the external coding
//! agent. [`CommandAgent`] spawns the configured command; [`ManualAgent`]
//! hands the prompt to a human operator. Tests use scripted agents that
//! return predetermined runs without spawning processes.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::config::AgentConfig;
use crate::io::operator::OperatorInput;
use crate::io::process::run_command_cancellable;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process (the project root).
    pub workdir: PathBuf,
    pub prompt: String,
    pub model: String,
    pub verbose: bool,
    /// Where `prompt.md` and `agent.log` for this invocation live.
    pub artifacts_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl AgentRequest {
    pub fn prompt_path(&self) -> PathBuf {
        self.artifacts_dir.join("prompt.md")
    }

    pub fn log_path(&self) -> PathBuf {
        self.artifacts_dir.join("agent.log")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Succeeded,
    Failed { code: Option<i32> },
    Cancelled,
}

/// What one agent invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub exit: AgentExit,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl AgentRun {
    /// Primary error text: stderr, or the exit status when stderr is empty.
    ///
    /// Stdout stays on the run; the retry controller only consults its tail
    /// when this text is unrecognised.
    pub fn raw_error(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit {
            AgentExit::Failed { code: Some(code) } => format!("agent exited with status {code}"),
            AgentExit::Failed { code: None } => "agent terminated by signal".to_string(),
            _ => String::new(),
        }
    }
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run one unit of work. `Err` means the agent could not be started at all.
    fn invoke(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Agent that spawns the configured command and writes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
    output_limit_bytes: usize,
}

impl CommandAgent {
    pub fn new(config: AgentConfig, output_limit_bytes: usize) -> Self {
        Self {
            config,
            output_limit_bytes,
        }
    }

    fn command(&self, request: &AgentRequest) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&self.config.model_flag)
            .arg(&request.model)
            .current_dir(&request.workdir);
        if request.verbose
            && let Some(flag) = &self.config.verbose_flag
        {
            cmd.arg(flag);
        }
        Ok(cmd)
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(model = %request.model, artifacts = %request.artifacts_dir.display()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentRun> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let cmd = self.command(request)?;
        let started = Instant::now();
        let output = run_command_cancellable(
            cmd,
            Some(request.prompt.as_bytes()),
            self.output_limit_bytes,
            Some(&request.log_path()),
            &request.cancel,
        )
        .context("run agent command")?;

        let exit = if output.cancelled {
            AgentExit::Cancelled
        } else if output.status.success() {
            AgentExit::Succeeded
        } else {
            warn!(exit_code = ?output.status.code(), "agent exited with failure");
            AgentExit::Failed {
                code: output.status.code(),
            }
        };
        debug!(?exit, "agent finished");
        Ok(AgentRun {
            exit,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            duration: started.elapsed(),
        })
    }
}

/// Agent driven by a human: the prompt is written to disk and the operator
/// answers `done`, `fail <reason>` or `quit`.
pub struct ManualAgent {
    input: OperatorInput,
}

impl ManualAgent {
    pub fn new(input: OperatorInput) -> Self {
        Self { input }
    }
}

impl Agent for ManualAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentRun> {
        let prompt_path = request.prompt_path();
        if let Some(parent) = prompt_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&prompt_path, &request.prompt)
            .with_context(|| format!("write prompt {}", prompt_path.display()))?;

        let started = Instant::now();
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "Prompt written to {}", prompt_path.display()).context("write stderr")?;
        writeln!(
            stderr,
            "Run it with your agent, then answer: done | fail <reason> | quit"
        )
        .context("write stderr")?;

        loop {
            if request.cancel.is_cancelled() {
                return Ok(manual_run(AgentExit::Cancelled, "", started));
            }
            write!(stderr, "> ").context("write stderr")?;
            stderr.flush().context("flush stderr")?;
            let Some(line) = self.input.read_line().context("read operator answer")? else {
                return Ok(manual_run(AgentExit::Cancelled, "", started));
            };
            let answer = line.trim();
            let (verb, reason) = answer
                .split_once(char::is_whitespace)
                .unwrap_or((answer, ""));
            match verb.to_ascii_lowercase().as_str() {
                "done" => return Ok(manual_run(AgentExit::Succeeded, "", started)),
                "quit" => return Ok(manual_run(AgentExit::Cancelled, "", started)),
                "fail" => {
                    let reason = match reason.trim() {
                        "" => "operator reported failure",
                        reason => reason,
                    };
                    return Ok(manual_run(AgentExit::Failed { code: None }, reason, started));
                }
                _ => {
                    writeln!(stderr, "unrecognised answer '{answer}'").context("write stderr")?;
                }
            }
        }
    }
}

fn manual_run(exit: AgentExit, stderr: &str, started: Instant) -> AgentRun {
    AgentRun {
        exit,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration: started.elapsed(),
    }
}
