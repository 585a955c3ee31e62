//! Test-only fakes and a throwaway workspace.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::build_loop::{FailureDecider, FailureDecision};
use crate::context::{EngineContext, RunOverrides};
use crate::core::types::IterationResult;
use crate::io::agent::{Agent, AgentExit, AgentRequest, AgentRun};
use crate::io::init::{InitOptions, init_workspace};
use crate::io::registry::Session;
use crate::retry::Sleeper;

/// Records requested waits instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.waits.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        self.waits.borrow_mut().push(duration);
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
enum ScriptedResponse {
    Exit {
        exit: AgentExit,
        stdout: String,
        stderr: String,
    },
    SpawnError(String),
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    response: ScriptedResponse,
    /// Files written relative to the request workdir before returning.
    writes: Vec<(PathBuf, String)>,
    cancel: Option<CancellationToken>,
}

impl ScriptedRun {
    fn exit(exit: AgentExit, stdout: &str, stderr: &str) -> Self {
        Self {
            response: ScriptedResponse::Exit {
                exit,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
            writes: Vec::new(),
            cancel: None,
        }
    }

    pub fn succeed(stdout: impl Into<String>) -> Self {
        Self::exit(AgentExit::Succeeded, &stdout.into(), "")
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self::exit(AgentExit::Failed { code: Some(1) }, "", &stderr.into())
    }

    pub fn cancelled() -> Self {
        Self::exit(AgentExit::Cancelled, "", "")
    }

    /// The agent binary could not be started at all.
    pub fn spawn_error(message: impl Into<String>) -> Self {
        Self {
            response: ScriptedResponse::SpawnError(message.into()),
            writes: Vec::new(),
            cancel: None,
        }
    }

    pub fn writing(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.writes.push((path.into(), contents.into()));
        self
    }

    /// Fire `token` while the agent is "running".
    pub fn cancelling(mut self, token: &CancellationToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }
}

/// Plays back [`ScriptedRun`]s in order and records prompts.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    script: RefCell<VecDeque<ScriptedRun>>,
    prompts: RefCell<Vec<String>>,
    calls: Cell<usize>,
}

impl ScriptedAgent {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            prompts: RefCell::new(Vec::new()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentRun> {
        self.calls.set(self.calls.get() + 1);
        self.prompts.borrow_mut().push(request.prompt.clone());
        let run = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent ran out of responses"))?;

        for (path, contents) in &run.writes {
            let path = request.workdir.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(token) = &run.cancel {
            token.cancel();
        }

        match run.response {
            ScriptedResponse::Exit {
                exit,
                stdout,
                stderr,
            } => Ok(AgentRun {
                exit,
                stdout,
                stderr,
                duration: Duration::from_millis(10),
            }),
            ScriptedResponse::SpawnError(message) => Err(anyhow!(message)),
        }
    }
}

/// Answers failure prompts from a fixed list, then stops.
#[derive(Debug, Default)]
pub struct ScriptedDecider {
    answers: VecDeque<FailureDecision>,
    seen: Vec<String>,
}

impl ScriptedDecider {
    pub fn new(answers: Vec<FailureDecision>) -> Self {
        Self {
            answers: answers.into(),
            seen: Vec::new(),
        }
    }

    /// Tasks (or unit kinds) the decider was asked about.
    pub fn seen(&self) -> &[String] {
        &self.seen
    }
}

impl FailureDecider for ScriptedDecider {
    fn decide(&mut self, task: &str, _failure: &IterationResult) -> FailureDecision {
        self.seen.push(task.to_string());
        self.answers.pop_front().unwrap_or(FailureDecision::Stop)
    }
}

/// Initialized project in a temp dir with a loaded engine context.
pub struct TestWorkspace {
    _temp: TempDir,
    pub ctx: EngineContext,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Self::with_overrides(&RunOverrides::default())
    }

    pub fn with_overrides(overrides: &RunOverrides) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        init_workspace(temp.path(), &InitOptions { force: false })?;
        let ctx = EngineContext::load(temp.path(), overrides, CancellationToken::new())?;
        Ok(Self { _temp: temp, ctx })
    }

    pub fn root(&self) -> &Path {
        &self.ctx.paths.root
    }

    /// Create a session and make it active.
    pub fn session(&self, name: &str) -> Result<Session> {
        let session = self.ctx.registry.create(name, "")?;
        self.ctx.registry.set_active(&session.id)
    }

    pub fn write_plan(&self, session: &Session, contents: &str) -> Result<()> {
        let path = session.plan_path(&self.ctx.paths);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_plan(&self, session: &Session) -> Result<String> {
        let path = session.plan_path(&self.ctx.paths);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Drop one markdown spec into the session's specs folder.
    pub fn write_spec(&self, session: &Session, name: &str, contents: &str) -> Result<PathBuf> {
        let dir = self.ctx.paths.session(&session.id).specs_dir;
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
