//! Mode dispatch: drives a session through its phases.
//!
//! The plan document and the session's spec source decide the next phase every
//! time the engine re-enters its loop; checkpoints only carry progress and
//! error state between runs.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::build_loop::{FailureDecider, FailureDecision, LoopStop, run_build_loop};
use crate::context::EngineContext;
use crate::core::phase::{PhaseEvent, PhaseInputs, PhaseMachine, determine_next_phase};
use crate::core::plan::{self, TaskCounts};
use crate::core::types::{ErrorClassification, ErrorPayload, Phase};
use crate::exit_codes;
use crate::io::agent::Agent;
use crate::io::checkpoint::Checkpoint;
use crate::io::iteration_log::UnitKind;
use crate::io::plan_store;
use crate::io::prompt::SessionPromptContext;
use crate::io::registry::Session;
use crate::iteration::{UnitOfWork, run_unit};
use crate::retry::Sleeper;

/// Engine entry modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Run whichever phase the session needs, until done or stopped.
    #[default]
    Auto,
    /// Plan (or replan) once.
    Plan,
    /// Build pending tasks only.
    Build,
    /// Refresh the agent guidance file.
    Agents,
    /// Resume from the session checkpoint.
    Continue,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Plan => "plan",
            Mode::Build => "build",
            Mode::Agents => "agents",
            Mode::Continue => "continue",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Mode::Auto),
            "plan" => Ok(Mode::Plan),
            "build" => Ok(Mode::Build),
            "agents" => Ok(Mode::Agents),
            "continue" => Ok(Mode::Continue),
            other => Err(anyhow!("unknown mode '{other}'")),
        }
    }
}

/// How an engine run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task in the plan is complete.
    Complete,
    /// Planning produced pending work (plan mode).
    Planned { pending: usize },
    /// The agent guidance file was refreshed.
    AgentsUpdated,
    LimitReached { pending: usize },
    Cancelled,
    Halted(ErrorClassification),
    Exhausted { unit: String },
    NoSpecSource,
    NoTasksPlanned,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Complete | RunOutcome::Planned { .. } | RunOutcome::AgentsUpdated => {
                exit_codes::OK
            }
            RunOutcome::Halted(_) => exit_codes::HALTED,
            RunOutcome::LimitReached { .. } => exit_codes::LIMIT_REACHED,
            RunOutcome::Exhausted { .. } => exit_codes::EXHAUSTED,
            RunOutcome::NoSpecSource | RunOutcome::NoTasksPlanned => exit_codes::NOTHING_TO_DO,
            RunOutcome::Cancelled => exit_codes::CANCELLED,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Complete => write!(f, "all tasks complete"),
            RunOutcome::Planned { pending } => write!(f, "plan ready with {pending} pending task(s)"),
            RunOutcome::AgentsUpdated => write!(f, "agent guidance updated"),
            RunOutcome::LimitReached { pending } => {
                write!(f, "iteration limit reached with {pending} task(s) pending")
            }
            RunOutcome::Cancelled => write!(f, "cancelled; last checkpoint preserved"),
            RunOutcome::Halted(c) => write!(
                f,
                "halted by {} error: {}{}",
                c.kind,
                c.message,
                if c.resumable {
                    " (resumable with --mode continue)"
                } else {
                    " (not resumable until fixed)"
                }
            ),
            RunOutcome::Exhausted { unit } => write!(f, "stopped after repeated failures on: {unit}"),
            RunOutcome::NoSpecSource => write!(f, "no usable spec source configured"),
            RunOutcome::NoTasksPlanned => write!(f, "planning produced no pending tasks"),
        }
    }
}

/// Result of a phase-level unit (spec, plan, agents).
enum PhaseUnit {
    Done,
    Stopped(RunOutcome),
}

/// Drives one session with fixed collaborators.
pub struct Engine<'a, A: Agent, S: Sleeper, D: FailureDecider> {
    ctx: &'a EngineContext,
    agent: &'a A,
    sleeper: &'a S,
    decider: &'a mut D,
}

impl<'a, A: Agent, S: Sleeper, D: FailureDecider> Engine<'a, A, S, D> {
    pub fn new(ctx: &'a EngineContext, agent: &'a A, sleeper: &'a S, decider: &'a mut D) -> Self {
        Self {
            ctx,
            agent,
            sleeper,
            decider,
        }
    }

    #[instrument(skip_all, fields(session_id = %session.id, mode = %mode))]
    pub fn run(&mut self, session: &Session, mode: Mode) -> Result<RunOutcome> {
        info!("engine starting");
        let outcome = match mode {
            Mode::Auto => self.run_auto(session, PhaseMachine::new()),
            Mode::Plan => self.run_plan_only(session),
            Mode::Build => self.run_build_only(session),
            Mode::Agents => self.run_agents(session),
            Mode::Continue => self.run_continue(session),
        }?;
        info!(%outcome, "engine finished");
        self.log_progress(session, &format!("{mode} run finished: {outcome}"));
        Ok(outcome)
    }

    fn run_auto(&mut self, session: &Session, mut machine: PhaseMachine) -> Result<RunOutcome> {
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            let inputs = self.phase_inputs(session)?;
            let next = determine_next_phase(&inputs);
            advance(&mut machine, next, inputs.tasks);
            match next {
                Phase::SpecCreation => {
                    if !self.ctx.interactive {
                        return Ok(RunOutcome::NoSpecSource);
                    }
                    if let PhaseUnit::Stopped(outcome) =
                        self.run_spec_creation(session, &mut machine)?
                    {
                        return Ok(outcome);
                    }
                    if !session.spec_source_available(&self.ctx.paths) {
                        return Ok(RunOutcome::NoSpecSource);
                    }
                }
                Phase::Planning => {
                    if let PhaseUnit::Stopped(outcome) = self.run_planning(session, &mut machine)? {
                        return Ok(outcome);
                    }
                    if self.task_counts(session)?.pending == 0 {
                        return Ok(RunOutcome::NoTasksPlanned);
                    }
                }
                Phase::Building => {
                    self.enter_phase(session, Phase::Building)?;
                    let loop_outcome =
                        run_build_loop(self.ctx, session, self.agent, self.sleeper, &mut *self.decider)?;
                    match loop_outcome.stop {
                        // Re-evaluate: the plan may have grown while building.
                        LoopStop::AllComplete => {}
                        stop => return Ok(loop_stop_outcome(stop)),
                    }
                }
                Phase::Complete => return Ok(RunOutcome::Complete),
                Phase::Idle | Phase::Error => {
                    return Err(anyhow!("phase determination returned {next}"));
                }
            }
        }
    }

    fn run_plan_only(&mut self, session: &Session) -> Result<RunOutcome> {
        if !session.spec_source_available(&self.ctx.paths) {
            return Ok(RunOutcome::NoSpecSource);
        }
        let mut machine = PhaseMachine::new();
        if let PhaseUnit::Stopped(outcome) = self.run_planning(session, &mut machine)? {
            return Ok(outcome);
        }
        let pending = self.task_counts(session)?.pending;
        if pending == 0 {
            return Ok(RunOutcome::NoTasksPlanned);
        }
        Ok(RunOutcome::Planned { pending })
    }

    fn run_build_only(&mut self, session: &Session) -> Result<RunOutcome> {
        let counts = self.task_counts(session)?;
        if counts.total == 0 {
            return Ok(RunOutcome::NoTasksPlanned);
        }
        if counts.pending > 0 {
            self.enter_phase(session, Phase::Building)?;
        }
        let outcome = run_build_loop(self.ctx, session, self.agent, self.sleeper, &mut *self.decider)?;
        Ok(loop_stop_outcome(outcome.stop))
    }

    fn run_agents(&mut self, session: &Session) -> Result<RunOutcome> {
        let prompt = self
            .ctx
            .prompts
            .render_agents(&SessionPromptContext::new(session, &self.ctx.paths))?;
        let mut machine = PhaseMachine::new();
        match self.run_phase_unit(session, &mut machine, UnitKind::Agents, prompt)? {
            PhaseUnit::Done => Ok(RunOutcome::AgentsUpdated),
            PhaseUnit::Stopped(outcome) => Ok(outcome),
        }
    }

    /// Resume from the checkpoint. Iteration numbering continues from it.
    fn run_continue(&mut self, session: &Session) -> Result<RunOutcome> {
        let checkpoint = self
            .ctx
            .checkpoints()
            .load(&session.id)
            .ok_or_else(|| anyhow!("session {} has no checkpoint to resume", session.id))?;
        if !checkpoint.is_resumable() {
            return Err(anyhow!(
                "session {} cannot be resumed from its checkpoint (phase {})",
                session.id,
                checkpoint.phase
            ));
        }
        info!(
            phase = %checkpoint.phase,
            next_iteration = checkpoint.next_iteration(),
            "resuming from checkpoint"
        );

        let resume_phase = match (&checkpoint.phase, &checkpoint.error) {
            (Phase::Error, Some(payload)) => {
                let inputs = self.phase_inputs(session)?;
                let mut machine = PhaseMachine::halted(
                    determine_next_phase(&inputs),
                    ErrorClassification::from(payload),
                );
                machine.apply(PhaseEvent::Resume)?
            }
            (phase, _) => *phase,
        };

        match resume_phase {
            Phase::Planning => {
                let mut machine = PhaseMachine::starting_at(Phase::Planning);
                if let PhaseUnit::Stopped(outcome) = self.run_planning(session, &mut machine)? {
                    return Ok(outcome);
                }
                if self.task_counts(session)?.pending == 0 {
                    return Ok(RunOutcome::NoTasksPlanned);
                }
                self.run_auto(session, machine)
            }
            Phase::Building => self.run_build_only(session),
            _ => self.run_auto(session, PhaseMachine::new()),
        }
    }

    fn run_spec_creation(
        &mut self,
        session: &Session,
        machine: &mut PhaseMachine,
    ) -> Result<PhaseUnit> {
        let target = session
            .specs_dir(&self.ctx.paths)
            .unwrap_or_else(|| self.ctx.paths.session(&session.id).specs_dir);
        let target = target
            .strip_prefix(&self.ctx.paths.root)
            .unwrap_or(&target)
            .display()
            .to_string();
        let prompt = self
            .ctx
            .prompts
            .render_spec(&SessionPromptContext::new(session, &self.ctx.paths), &target)?;
        self.run_phase_unit(session, machine, UnitKind::Spec, prompt)
    }

    fn run_planning(&mut self, session: &Session, machine: &mut PhaseMachine) -> Result<PhaseUnit> {
        self.enter_phase(session, Phase::Planning)?;
        let counts = self.task_counts(session)?;
        let prompt = self.ctx.prompts.render_plan(
            &SessionPromptContext::new(session, &self.ctx.paths),
            counts.total,
            counts.completed(),
        )?;
        let unit = self.run_phase_unit(session, machine, UnitKind::Plan, prompt)?;
        if matches!(unit, PhaseUnit::Done) {
            let pending = self.task_counts(session)?.pending;
            if machine.current() == Phase::Planning {
                apply_logged(machine, PhaseEvent::PlanProduced { pending });
            }
            info!(pending, "planning finished");
            self.log_progress(session, &format!("planning finished: {pending} pending task(s)"));
        }
        Ok(unit)
    }

    /// Run a phase-level unit, asking the decider on exhausted failures.
    fn run_phase_unit(
        &mut self,
        session: &Session,
        machine: &mut PhaseMachine,
        kind: UnitKind,
        prompt: String,
    ) -> Result<PhaseUnit> {
        loop {
            let unit = UnitOfWork::phase(kind, prompt.clone());
            let report = run_unit(self.ctx, session, self.agent, self.sleeper, &unit)?;
            let result = report.result;
            if result.is_success() {
                return Ok(PhaseUnit::Done);
            }
            if result.is_cancelled() {
                return Ok(PhaseUnit::Stopped(RunOutcome::Cancelled));
            }
            if let Some(halt) = result.classification.as_ref().filter(|c| c.halts()) {
                self.record_halt(session, machine, halt)?;
                return Ok(PhaseUnit::Stopped(RunOutcome::Halted(halt.clone())));
            }
            self.log_progress(
                session,
                &format!("{} unit failed after {} attempt(s)", kind.as_str(), report.attempts),
            );
            match self.decider.decide(kind.as_str(), &result) {
                FailureDecision::Retry => continue,
                FailureDecision::Skip | FailureDecision::Stop => {
                    return Ok(PhaseUnit::Stopped(RunOutcome::Exhausted {
                        unit: kind.as_str().to_string(),
                    }));
                }
            }
        }
    }

    /// Phase-level halts are recorded as an `Error` checkpoint.
    fn record_halt(
        &self,
        session: &Session,
        machine: &mut PhaseMachine,
        halt: &ErrorClassification,
    ) -> Result<()> {
        apply_logged(machine, PhaseEvent::Halted(halt.clone()));
        let checkpoint = self
            .boundary_checkpoint(session, machine.current())?
            .with_error(ErrorPayload::from(halt));
        self.ctx.checkpoints().save(&checkpoint);
        warn!(kind = %halt.kind, message = %halt.message, resumable = halt.resumable, "phase halted");
        self.log_progress(session, &format!("halted ({}): {}", halt.kind, halt.message));
        Ok(())
    }

    /// Write a boundary checkpoint unless the session already sits in `phase`.
    fn enter_phase(&self, session: &Session, phase: Phase) -> Result<()> {
        let existing = self.ctx.checkpoints().load(&session.id);
        if existing
            .as_ref()
            .is_some_and(|c| c.phase == phase && c.error.is_none())
        {
            return Ok(());
        }
        let checkpoint = self.boundary_checkpoint(session, phase)?;
        self.ctx.checkpoints().save(&checkpoint);
        info!(%phase, "entered phase");
        self.log_progress(session, &format!("entered {phase}"));
        Ok(())
    }

    fn boundary_checkpoint(&self, session: &Session, phase: Phase) -> Result<Checkpoint> {
        let last = self.ctx.checkpoints().load(&session.id);
        let iteration = last.as_ref().map_or(0, |c| c.iteration);
        let tasks = plan_store::load_tasks(&session.plan_path(&self.ctx.paths))?;
        Ok(Checkpoint::new(
            &session.id,
            phase,
            iteration,
            "",
            plan::completed_texts(&tasks),
        ))
    }

    fn phase_inputs(&self, session: &Session) -> Result<PhaseInputs> {
        Ok(PhaseInputs {
            spec_source_available: session.spec_source_available(&self.ctx.paths),
            tasks: self.task_counts(session)?,
        })
    }

    fn task_counts(&self, session: &Session) -> Result<TaskCounts> {
        plan_store::task_counts(&session.plan_path(&self.ctx.paths))
    }

    fn log_progress(&self, session: &Session, entry: &str) {
        if let Err(err) = session.progress_log(&self.ctx.paths).append(entry) {
            warn!(err = %format!("{err:#}"), "failed to append progress log");
        }
    }
}

/// Move the machine to `next`. The plan is authoritative, so a jump the
/// transition table does not model re-seats the machine instead of failing.
fn advance(machine: &mut PhaseMachine, next: Phase, tasks: TaskCounts) {
    if machine.current() == next {
        return;
    }
    let event = match next {
        Phase::SpecCreation => PhaseEvent::NoSpecSource,
        Phase::Planning => PhaseEvent::SpecAvailable,
        Phase::Building => PhaseEvent::PlanProduced {
            pending: tasks.pending,
        },
        Phase::Complete => PhaseEvent::AllTasksComplete { total: tasks.total },
        Phase::Idle | Phase::Error => return,
    };
    let from = machine.current();
    if let Err(err) = machine.apply(event) {
        debug!(%err, %from, to = %next, "re-seating phase machine");
        *machine = PhaseMachine::starting_at(next);
    }
}

fn apply_logged(machine: &mut PhaseMachine, event: PhaseEvent) {
    if let Err(err) = machine.apply(event) {
        debug!(%err, "phase event ignored");
    }
}

fn loop_stop_outcome(stop: LoopStop) -> RunOutcome {
    match stop {
        LoopStop::AllComplete => RunOutcome::Complete,
        LoopStop::LimitReached { pending } => RunOutcome::LimitReached { pending },
        LoopStop::Cancelled => RunOutcome::Cancelled,
        LoopStop::Halted(c) => RunOutcome::Halted(c),
        LoopStop::Exhausted { task, .. } => RunOutcome::Exhausted { unit: task },
    }
}

/// Snapshot shown by `taskloop status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub session: Session,
    pub next_phase: Phase,
    pub tasks: TaskCounts,
    pub next_task: Option<String>,
    pub spec_source_available: bool,
    pub checkpoint: Option<Checkpoint>,
    pub can_resume: bool,
    pub recent_progress: Vec<String>,
}

pub fn session_status(ctx: &EngineContext, session: &Session) -> Result<StatusReport> {
    let tasks = plan_store::load_tasks(&session.plan_path(&ctx.paths))?;
    let counts = plan::count_tasks(&tasks);
    let spec_source_available = session.spec_source_available(&ctx.paths);
    let checkpoint = ctx.checkpoints().load(&session.id);
    let can_resume = checkpoint.as_ref().is_some_and(Checkpoint::is_resumable);
    Ok(StatusReport {
        next_phase: determine_next_phase(&PhaseInputs {
            spec_source_available,
            tasks: counts,
        }),
        tasks: counts,
        next_task: plan::next_pending(&tasks).map(|task| task.text.clone()),
        spec_source_available,
        checkpoint,
        can_resume,
        recent_progress: session.progress_log(&ctx.paths).tail(5)?,
        session: session.clone(),
    })
}
