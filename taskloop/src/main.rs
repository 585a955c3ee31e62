//! `taskloop`: drive a coding agent through a session's plan, one task at a time.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use taskloop::build_loop::{PromptDecider, StopDecider};
use taskloop::context::{EngineContext, RunOverrides};
use taskloop::engine::{Engine, Mode, RunOutcome, StatusReport, session_status};
use taskloop::exit_codes;
use taskloop::io::agent::{Agent, CommandAgent, ManualAgent};
use taskloop::io::init::{InitOptions, init_workspace};
use taskloop::io::operator::OperatorInput;
use taskloop::io::plan_store;
use taskloop::io::registry::{RegistryError, Session, SourceKind};
use taskloop::retry::ThreadSleeper;
use taskloop::{logging, signals};

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Resumable, failure-aware loop runner for coding agents"
)]
struct Cli {
    /// Project root holding `.taskloop/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Debug-level diagnostics on stderr (and the agent's verbose flag).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskloop/` scaffolding and the default config.
    Init {
        /// Overwrite engine-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Drive the engine for a session.
    Run(RunArgs),
    /// Manage sessions.
    #[command(subcommand)]
    Session(SessionCommand),
    /// Show phase, task counts, checkpoint and recent progress.
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// Plan document maintenance.
    #[command(subcommand)]
    Plan(PlanCommand),
    /// Inspect or clear a session checkpoint.
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
    /// Print how a raw error message would be classified.
    Classify { message: String },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    mode: ModeArg,
    #[arg(long)]
    model: Option<String>,
    /// Loop passes for this invocation; 0 means unlimited.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Print prompts and wait for the operator instead of spawning the agent.
    #[arg(long)]
    manual: bool,
    /// Let the agent delegate work to subagents.
    #[arg(long)]
    delegate: bool,
    #[arg(long)]
    session: Option<String>,
    /// Never prompt: stop on unresolved failures and skip spec creation.
    #[arg(long)]
    non_interactive: bool,
}

#[derive(Subcommand)]
enum SessionCommand {
    New {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Make the new session active.
        #[arg(long)]
        activate: bool,
    },
    List,
    Show { id: Option<String> },
    /// Make a session active.
    Use { id: String },
    Remove { id: String },
    Archive { id: String },
    /// Choose where the session's specs come from.
    Specs {
        id: String,
        #[arg(long, value_enum)]
        source: SourceArg,
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Choose where the session's references come from.
    References {
        id: String,
        #[arg(long, value_enum)]
        source: SourceArg,
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Rewrite the plan to its empty placeholder.
    Reset {
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum CheckpointCommand {
    Show {
        #[arg(long)]
        session: Option<String>,
    },
    Clear {
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Auto,
    Plan,
    Build,
    Agents,
    Continue,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Auto => Mode::Auto,
            ModeArg::Plan => Mode::Plan,
            ModeArg::Build => Mode::Build,
            ModeArg::Agents => Mode::Agents,
            ModeArg::Continue => Mode::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Session,
    Global,
    Custom,
    None,
}

impl From<SourceArg> for SourceKind {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Session => SourceKind::Session,
            SourceArg::Global => SourceKind::Global,
            SourceArg::Custom => SourceKind::Custom,
            SourceArg::None => SourceKind::None,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = err.downcast_ref::<RegistryError>().and_then(registry_hint) {
                eprintln!("hint: {hint}");
            }
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn registry_hint(err: &RegistryError) -> Option<&'static str> {
    match err {
        RegistryError::NotFound { .. } => Some("run `taskloop session list` to see session ids"),
        RegistryError::Archived { .. } => Some("archived sessions are read-only; create a new one"),
        RegistryError::NoActiveSession => Some("create one with `taskloop session new <name> --activate`"),
        RegistryError::AlreadyExists { .. } | RegistryError::InvalidName { .. } => None,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Run(args) => cmd_run(root, cli.verbose, args),
        Command::Session(command) => cmd_session(root, command),
        Command::Status { session } => cmd_status(root, session.as_deref()),
        Command::Plan(PlanCommand::Reset { session }) => cmd_plan_reset(root, session.as_deref()),
        Command::Checkpoint(command) => cmd_checkpoint(root, command),
        Command::Classify { message } => cmd_classify(root, &message),
    }
}

/// Load the context for an initialized workspace.
fn open(root: &Path, overrides: &RunOverrides, cancel: CancellationToken) -> Result<EngineContext> {
    let ctx = EngineContext::load(root, overrides, cancel)?;
    if !ctx.paths.state_dir.is_dir() {
        return Err(anyhow!(
            "{} is not a taskloop workspace (run `taskloop init`)",
            ctx.paths.root.display()
        ));
    }
    Ok(ctx)
}

fn open_default(root: &Path) -> Result<EngineContext> {
    open(root, &RunOverrides::default(), CancellationToken::new())
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, verbose: bool, args: RunArgs) -> Result<i32> {
    let cancel = CancellationToken::new();
    signals::install(cancel.clone())?;
    let overrides = RunOverrides {
        model: args.model,
        max_iterations: args.max_iterations,
        verbose,
        delegate: args.delegate,
        interactive: !args.non_interactive && io::stdin().is_terminal(),
    };
    let ctx = open(root, &overrides, cancel)?;
    let session = ctx.registry.resolve(args.session.as_deref())?;
    if session.is_archived() {
        return Err(RegistryError::Archived { id: session.id }.into());
    }

    let mode = Mode::from(args.mode);
    // One stdin reader for every operator prompt.
    let input = OperatorInput::stdin();
    let outcome = if args.manual {
        drive(&ctx, &session, mode, &ManualAgent::new(input.clone()), input)?
    } else {
        let agent = CommandAgent::new(ctx.config.agent.clone(), ctx.config.agent_output_limit_bytes);
        drive(&ctx, &session, mode, &agent, input)?
    };
    println!("{}: {outcome}", session.id);
    Ok(outcome.exit_code())
}

fn drive<A: Agent>(
    ctx: &EngineContext,
    session: &Session,
    mode: Mode,
    agent: &A,
    input: OperatorInput,
) -> Result<RunOutcome> {
    let sleeper = ThreadSleeper;
    if ctx.interactive {
        let mut decider = PromptDecider::new(input);
        Engine::new(ctx, agent, &sleeper, &mut decider).run(session, mode)
    } else {
        let mut decider = StopDecider;
        Engine::new(ctx, agent, &sleeper, &mut decider).run(session, mode)
    }
}

fn cmd_session(root: &Path, command: SessionCommand) -> Result<i32> {
    let ctx = open_default(root)?;
    let registry = &ctx.registry;
    match command {
        SessionCommand::New {
            name,
            description,
            activate,
        } => {
            let session = registry.create(&name, &description)?;
            if activate {
                registry.set_active(&session.id)?;
            }
            println!("{}", session.id);
        }
        SessionCommand::List => {
            let active = registry.active_id()?;
            for session in registry.list()? {
                let marker = if active.as_deref() == Some(session.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                let status = if session.is_archived() { " (archived)" } else { "" };
                println!("{marker} {}  {}{status}", session.id, session.name);
            }
        }
        SessionCommand::Show { id } => {
            let session = registry.resolve(id.as_deref())?;
            let json = serde_json::to_string_pretty(&session).context("serialize session")?;
            println!("{json}");
        }
        SessionCommand::Use { id } => {
            let session = registry.set_active(&id)?;
            println!("active session: {}", session.id);
        }
        SessionCommand::Remove { id } => {
            registry.remove(&id)?;
            println!("removed {id}");
        }
        SessionCommand::Archive { id } => {
            let session = registry.archive(&id)?;
            println!("archived {}", session.id);
        }
        SessionCommand::Specs { id, source, folder } => {
            let session = registry.set_specs(&id, source.into(), folder)?;
            let available = session.spec_source_available(&ctx.paths);
            println!(
                "specs for {}: {source:?}{}",
                session.id,
                if available { "" } else { " (no usable spec documents yet)" }
            );
        }
        SessionCommand::References {
            id,
            source,
            folder,
            disable,
        } => {
            let session = registry.set_references(&id, source.into(), folder, !disable)?;
            println!(
                "references for {}: {source:?}{}",
                session.id,
                if session.references_enabled { "" } else { " (disabled)" }
            );
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, session: Option<&str>) -> Result<i32> {
    let ctx = open_default(root)?;
    let session = ctx.registry.resolve(session)?;
    print_status(&session_status(&ctx, &session)?);
    Ok(exit_codes::OK)
}

fn print_status(status: &StatusReport) {
    let session = &status.session;
    println!("session:    {} ({})", session.id, session.name);
    println!("next phase: {}", status.next_phase);
    println!(
        "tasks:      {} done, {} pending, {} total",
        status.tasks.completed(),
        status.tasks.pending,
        status.tasks.total
    );
    if let Some(task) = &status.next_task {
        println!("next task:  {task}");
    }
    if !status.spec_source_available {
        println!("specs:      no usable spec documents");
    }
    match &status.checkpoint {
        Some(checkpoint) => {
            println!(
                "checkpoint: {} at iteration {} (resumable: {})",
                checkpoint.phase,
                checkpoint.iteration,
                if status.can_resume { "yes" } else { "no" }
            );
            if let Some(error) = &checkpoint.error {
                println!("error:      {} ({})", error.message(), error.kind());
            }
        }
        None => println!("checkpoint: none"),
    }
    if !status.recent_progress.is_empty() {
        println!("recent progress:");
        for entry in &status.recent_progress {
            println!("  {entry}");
        }
    }
}

fn cmd_plan_reset(root: &Path, session: Option<&str>) -> Result<i32> {
    let ctx = open_default(root)?;
    let session = ctx.registry.resolve(session)?;
    plan_store::reset_plan(&session.plan_path(&ctx.paths))?;
    println!("plan reset for {}", session.id);
    Ok(exit_codes::OK)
}

fn cmd_checkpoint(root: &Path, command: CheckpointCommand) -> Result<i32> {
    let ctx = open_default(root)?;
    match command {
        CheckpointCommand::Show { session } => {
            let session = ctx.registry.resolve(session.as_deref())?;
            match ctx.checkpoints().load(&session.id) {
                Some(checkpoint) => {
                    let json =
                        serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?;
                    println!("{json}");
                }
                None => println!("no checkpoint for {}", session.id),
            }
        }
        CheckpointCommand::Clear { session } => {
            let session = ctx.registry.resolve(session.as_deref())?;
            ctx.checkpoints().delete(&session.id);
            println!("checkpoint cleared for {}", session.id);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_classify(root: &Path, message: &str) -> Result<i32> {
    let ctx = EngineContext::load(root, &RunOverrides::default(), CancellationToken::new())?;
    let classification = ctx.classifier.classify(message);
    println!("kind:      {}", classification.kind);
    println!("message:   {}", classification.message);
    println!("resumable: {}", classification.resumable);
    if let Some(wait) = classification.retry_after {
        println!("retry in:  {}s", wait.as_secs());
    }
    Ok(exit_codes::OK)
}
