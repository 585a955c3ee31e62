//! Build iteration loop: one pending task per pass until the plan is done.
//!
//! Safety rule: the plan is mutated first and the checkpoint written second,
//! and only after a unit of work succeeded. Cancellation, halts and exhausted
//! failures leave both untouched.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::context::EngineContext;
use crate::core::completion::{CompletionCheck, check_completion};
use crate::core::plan::{self, PlanTask};
use crate::core::types::{ErrorClassification, IterationResult, Phase};
use crate::io::agent::Agent;
use crate::io::checkpoint::Checkpoint;
use crate::io::operator::OperatorInput;
use crate::io::plan_store::{self, TaskMark};
use crate::io::progress_log::ProgressLog;
use crate::io::prompt::SessionPromptContext;
use crate::io::registry::Session;
use crate::iteration::{UnitOfWork, run_unit};
use crate::retry::Sleeper;

/// Operator choice after a failure the retry controller gave up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Run the same task again as a new pass.
    Retry,
    /// Mark the task complete with a skip annotation and move on.
    Skip,
    Stop,
}

/// Decides what to do with an exhausted or unknown failure.
pub trait FailureDecider {
    fn decide(&mut self, task: &str, failure: &IterationResult) -> FailureDecision;
}

/// Non-interactive runs never guess.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopDecider;

impl FailureDecider for StopDecider {
    fn decide(&mut self, _task: &str, _failure: &IterationResult) -> FailureDecision {
        FailureDecision::Stop
    }
}

/// Asks the operator on stderr and reads the answer from `input`.
pub struct PromptDecider {
    input: OperatorInput,
}

impl PromptDecider {
    pub fn new(input: OperatorInput) -> Self {
        Self { input }
    }
}

impl FailureDecider for PromptDecider {
    fn decide(&mut self, task: &str, failure: &IterationResult) -> FailureDecision {
        let mut stderr = std::io::stderr().lock();
        let message = failure
            .classification
            .as_ref()
            .map(|c| format!("{} ({})", c.message, c.kind))
            .unwrap_or_else(|| "unclassified failure".to_string());
        let _ = writeln!(stderr, "\nTask failed: {task}\n  {message}");
        if let Some(raw) = failure.raw_error() {
            let _ = writeln!(stderr, "  raw: {}", raw.lines().next().unwrap_or_default());
        }
        loop {
            let _ = write!(stderr, "[r]etry, [s]kip, or s[t]op? ");
            let _ = stderr.flush();
            let Ok(Some(line)) = self.input.read_line() else {
                return FailureDecision::Stop;
            };
            match line.trim().to_ascii_lowercase().as_str() {
                "r" | "retry" => return FailureDecision::Retry,
                "s" | "skip" => return FailureDecision::Skip,
                "t" | "stop" | "q" | "quit" => return FailureDecision::Stop,
                _ => {}
            }
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No pending tasks remain.
    AllComplete,
    /// `max_iterations` passes ran and work is still pending.
    LimitReached { pending: usize },
    Cancelled,
    /// Fatal or critical failure.
    Halted(ErrorClassification),
    /// A failure the operator chose not to retry or skip.
    Exhausted {
        task: String,
        classification: Option<ErrorClassification>,
    },
}

/// Summary of one loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub session_id: String,
    /// Number the first pass of this run used.
    pub first_iteration: u32,
    /// Passes executed, including failed ones.
    pub passes: u32,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    /// Tasks that succeeded but whose plan line was gone afterwards.
    pub vanished: Vec<String>,
    pub stop: LoopStop,
}

/// Run the build loop for `session` until a stop condition.
#[instrument(skip_all, fields(session_id = %session.id, max_iterations = ctx.max_iterations))]
pub fn run_build_loop<A: Agent, S: Sleeper, D: FailureDecider>(
    ctx: &EngineContext,
    session: &Session,
    agent: &A,
    sleeper: &S,
    decider: &mut D,
) -> Result<LoopOutcome> {
    let plan_path = session.plan_path(&ctx.paths);
    let progress = session.progress_log(&ctx.paths);
    let checkpoints = ctx.checkpoints();
    let mut last_attempted = checkpoints
        .load(&session.id)
        .map_or(0, |checkpoint| checkpoint.iteration);
    let mut last_completed = last_attempted;
    let mut outcome = LoopOutcome {
        session_id: session.id.clone(),
        first_iteration: last_attempted + 1,
        passes: 0,
        completed: Vec::new(),
        skipped: Vec::new(),
        vanished: Vec::new(),
        stop: LoopStop::AllComplete,
    };
    info!(next_iteration = outcome.first_iteration, "build loop starting");

    loop {
        if ctx.cancel.is_cancelled() {
            outcome.stop = LoopStop::Cancelled;
            return Ok(outcome);
        }

        // Re-read every pass: a human may have edited the plan.
        let tasks = plan_store::load_tasks(&plan_path)?;
        let counts = plan::count_tasks(&tasks);
        let Some(task) = plan::next_pending(&tasks).cloned() else {
            if counts.total > 0 {
                finalize(ctx, session, last_completed, &tasks);
            }
            outcome.stop = LoopStop::AllComplete;
            return Ok(outcome);
        };
        if ctx.max_iterations > 0 && outcome.passes >= ctx.max_iterations {
            info!(pending = counts.pending, "iteration limit reached");
            outcome.stop = LoopStop::LimitReached {
                pending: counts.pending,
            };
            return Ok(outcome);
        }

        let iteration = last_attempted + 1;
        last_attempted = iteration;
        outcome.passes += 1;
        debug!(iteration, task = %task.text, "starting iteration");

        let prompt = ctx.prompts.render_build(
            &SessionPromptContext::new(session, &ctx.paths),
            &task.text,
            &ctx.config.completion_signal,
            ctx.delegate,
        )?;
        let unit = UnitOfWork::build(iteration, &task.text, prompt);
        let report = run_unit(ctx, session, agent, sleeper, &unit)?;
        let result = report.result;

        if result.is_cancelled() {
            log_progress(&progress, &format!("iteration {iteration} cancelled: {}", task.text));
            outcome.stop = LoopStop::Cancelled;
            return Ok(outcome);
        }

        if result.is_success() {
            match plan_store::complete_task(&plan_path, &task.text)? {
                TaskMark::Marked => {}
                TaskMark::AlreadyComplete => {
                    debug!(iteration, task = %task.text, "task already ticked in plan");
                }
                TaskMark::Missing => {
                    warn!(iteration, task = %task.text, "completed task no longer in plan");
                    log_progress(
                        &progress,
                        &format!("iteration {iteration}: task vanished from plan: {}", task.text),
                    );
                    outcome.vanished.push(task.text.clone());
                }
            }
            last_completed = iteration;
            let tasks = plan_store::load_tasks(&plan_path)?;
            let checkpoint = Checkpoint::new(
                &session.id,
                Phase::Building,
                iteration,
                &task.text,
                plan::completed_texts(&tasks),
            )
            .completed_state();
            checkpoints.save(&checkpoint);
            info!(iteration, task = %task.text, attempts = report.attempts, "task complete");
            log_progress(
                &progress,
                &format!(
                    "iteration {iteration} completed: {} ({:.1}s)",
                    task.text,
                    result.duration.as_secs_f64()
                ),
            );
            outcome.completed.push(task.text.clone());

            let pending = plan::count_tasks(&tasks).pending;
            match check_completion(&result.output, &ctx.config.completion_signal, pending) {
                CompletionCheck::FalsePositive => {
                    warn!(pending, "agent claimed completion but tasks remain; ignoring");
                }
                check if check.is_complete() => {
                    finalize(ctx, session, last_completed, &tasks);
                    outcome.stop = LoopStop::AllComplete;
                    return Ok(outcome);
                }
                _ => {}
            }
            continue;
        }

        let classification = result.classification.clone();
        if let Some(halt) = classification.as_ref().filter(|c| c.halts()) {
            warn!(iteration, kind = %halt.kind, message = %halt.message, "iteration halted");
            log_progress(
                &progress,
                &format!(
                    "iteration {iteration} halted ({}): {}: {}",
                    halt.kind, task.text, halt.message
                ),
            );
            outcome.stop = LoopStop::Halted(halt.clone());
            return Ok(outcome);
        }

        log_progress(
            &progress,
            &format!(
                "iteration {iteration} failed after {} attempt(s): {}",
                report.attempts, task.text
            ),
        );
        match decider.decide(&task.text, &result) {
            FailureDecision::Retry => {
                info!(iteration, task = %task.text, "retrying task at operator request");
            }
            FailureDecision::Skip => {
                skip(&plan_path, &task)?;
                log_progress(&progress, &format!("skipped: {}", task.text));
                outcome.skipped.push(task.text.clone());
            }
            FailureDecision::Stop => {
                outcome.stop = LoopStop::Exhausted {
                    task: task.text.clone(),
                    classification,
                };
                return Ok(outcome);
            }
        }
    }
}

fn skip(plan_path: &Path, task: &PlanTask) -> Result<()> {
    plan_store::skip_task(plan_path, &task.text)
        .with_context(|| format!("skip task '{}'", task.text))
}

/// Write the terminal checkpoint, or delete it when configured to.
fn finalize(ctx: &EngineContext, session: &Session, last_completed: u32, tasks: &[PlanTask]) {
    let checkpoints = ctx.checkpoints();
    if ctx.config.delete_checkpoint_on_complete {
        checkpoints.delete(&session.id);
    } else {
        let last_task = checkpoints
            .load(&session.id)
            .map(|checkpoint| checkpoint.current_task)
            .unwrap_or_default();
        let terminal = Checkpoint::new(
            &session.id,
            Phase::Complete,
            last_completed,
            &last_task,
            plan::completed_texts(tasks),
        )
        .terminal();
        checkpoints.save(&terminal);
    }
    info!(session_id = %session.id, "all tasks complete");
    log_progress(&session.progress_log(&ctx.paths), "all tasks complete");
}

fn log_progress(log: &ProgressLog, entry: &str) {
    if let Err(err) = log.append(entry) {
        warn!(err = %format!("{err:#}"), "failed to append progress log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;
    use crate::io::agent::ManualAgent;
    use crate::test_support::{
        RecordingSleeper, ScriptedAgent, ScriptedDecider, ScriptedRun, TestWorkspace,
    };
    use std::fs;
    use std::io::Cursor;

    const SIGNAL: &str = "<promise>COMPLETE</promise>";

    #[test]
    fn completes_tasks_in_plan_order_and_checkpoints_each() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "# Plan\n- [ ] A\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("did A"), ScriptedRun::succeed(SIGNAL)]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(outcome.completed, vec!["A", "B"]);
        assert_eq!(outcome.first_iteration, 1);
        assert_eq!(ws.read_plan(&session).expect("plan"), "# Plan\n- [x] A\n- [x] B\n");
        assert!(agent.prompts()[0].contains("\nA\n"));
        assert!(!agent.prompts()[0].contains("\nB\n"));

        let checkpoint = ws.ctx.checkpoints().load(&session.id).expect("checkpoint");
        assert_eq!(checkpoint.phase, Phase::Complete);
        assert_eq!(checkpoint.iteration, 2);
        assert!(!checkpoint.can_resume);
        assert_eq!(checkpoint.completed_tasks, vec!["A", "B"]);
    }

    #[test]
    fn task_ticked_by_the_agent_still_checkpoints() {
        let mut ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::succeed("did A").writing(&session.plan_file, "- [x] A\n- [ ] B\n"),
            ScriptedRun::succeed("did B"),
        ]);
        ws.ctx.max_iterations = 1;

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::LimitReached { pending: 1 });
        assert_eq!(outcome.completed, vec!["A"]);
        assert!(outcome.vanished.is_empty());
        assert_eq!(ws.read_plan(&session).expect("plan"), "- [x] A\n- [ ] B\n");
        let checkpoint = ws.ctx.checkpoints().load(&session.id).expect("checkpoint");
        assert_eq!(checkpoint.iteration, 1);
        assert_eq!(checkpoint.current_task, "A");
        assert!(checkpoint.is_completed_state);
        assert_eq!(checkpoint.completed_tasks, vec!["A"]);

        ws.ctx.max_iterations = 0;
        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(outcome.first_iteration, 2);
        assert_eq!(ws.read_plan(&session).expect("plan"), "- [x] A\n- [x] B\n");
    }

    #[test]
    fn task_removed_during_iteration_is_reported_not_fatal() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::succeed("did A").writing(&session.plan_file, "- [ ] B\n"),
            ScriptedRun::succeed("did B"),
        ]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(outcome.vanished, vec!["A"]);
        assert_eq!(outcome.completed, vec!["A", "B"]);
        assert_eq!(ws.read_plan(&session).expect("plan"), "- [x] B\n");
        let progress = fs::read_to_string(session.progress_log(&ws.ctx.paths).path()).expect("progress");
        assert!(progress.contains("task vanished from plan: A"), "{progress}");
    }

    #[test]
    fn uncorroborated_completion_signal_is_ignored() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::succeed(format!("I'll print {SIGNAL} at the end")),
            ScriptedRun::succeed("done"),
        ]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.completed, vec!["A", "B"]);
        assert_eq!(agent.calls(), 2);
    }

    #[test]
    fn limit_counts_passes_in_this_run() {
        let mut ws = TestWorkspace::new().expect("workspace");
        ws.ctx.max_iterations = 1;
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("ok")]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::LimitReached { pending: 1 });
        assert_eq!(outcome.passes, 1);
    }

    #[test]
    fn halts_leave_plan_and_checkpoint_untouched() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n").expect("plan");
        let agent = ScriptedAgent::new(vec![ScriptedRun::fail("529 overloaded_error")]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        match outcome.stop {
            LoopStop::Halted(c) => assert_eq!(c.kind, ErrorKind::Critical),
            other => panic!("expected halt, got {other:?}"),
        }
        assert_eq!(agent.calls(), 1);
        assert_eq!(ws.read_plan(&session).expect("plan"), "- [ ] A\n");
        assert_eq!(ws.ctx.checkpoints().load(&session.id), None);
        let progress = session.progress_log(&ws.ctx.paths).tail(1).expect("tail");
        assert!(progress[0].contains("halted (critical)"));
    }

    #[test]
    fn agent_reported_cancellation_stops_without_writing() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![ScriptedRun::cancelled(), ScriptedRun::succeed("never")]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Cancelled);
        assert_eq!(agent.calls(), 1);
        assert!(outcome.completed.is_empty());
        assert_eq!(ws.read_plan(&session).expect("plan"), "- [ ] A\n- [ ] B\n");
        assert_eq!(ws.ctx.checkpoints().load(&session.id), None);
        let progress = session.progress_log(&ws.ctx.paths).tail(1).expect("tail");
        assert!(progress[0].contains("iteration 1 cancelled: A"));
    }

    #[test]
    fn skip_annotates_task_and_advances() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] Poison\n- [ ] B\n").expect("plan");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::fail("mystery failure"),
            ScriptedRun::succeed("ok"),
        ]);
        let mut decider = ScriptedDecider::new(vec![FailureDecision::Skip]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut decider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(outcome.skipped, vec!["Poison"]);
        assert_eq!(decider.seen(), vec!["Poison"]);
        assert_eq!(
            ws.read_plan(&session).expect("plan"),
            "- [x] Poison (SKIPPED)\n- [x] B\n"
        );
        // Pass 1 failed, pass 2 completed B.
        let checkpoint = ws.ctx.checkpoints().load(&session.id).expect("checkpoint");
        assert_eq!(checkpoint.iteration, 2);
    }

    #[test]
    fn retry_decision_runs_the_same_task_again() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n").expect("plan");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::fail("mystery failure"),
            ScriptedRun::succeed("ok"),
        ]);
        let mut decider = ScriptedDecider::new(vec![FailureDecision::Retry]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut decider,
        )
        .expect("loop");
        assert_eq!(outcome.completed, vec!["A"]);
        assert_eq!(outcome.passes, 2);
    }

    #[test]
    fn resumes_numbering_from_checkpoint() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [x] A\n- [ ] B\n").expect("plan");
        let previous = Checkpoint::new(&session.id, Phase::Building, 4, "A", vec!["A".to_string()]);
        assert!(ws.ctx.checkpoints().save(&previous));
        let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("ok")]);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(outcome.first_iteration, 5);
        let artifacts = ws.ctx.paths.session(&session.id).iteration_dir("5");
        assert!(artifacts.join("prompt.md").is_file());
        assert_eq!(ws.ctx.checkpoints().load(&session.id).expect("checkpoint").iteration, 5);
    }

    #[test]
    fn delete_on_complete_removes_checkpoint() {
        let mut ws = TestWorkspace::new().expect("workspace");
        ws.ctx.config.delete_checkpoint_on_complete = true;
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n").expect("plan");
        let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("ok")]);

        run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut StopDecider,
        )
        .expect("loop");
        assert_eq!(ws.ctx.checkpoints().load(&session.id), None);
        assert!(!ws.ctx.checkpoints().path(&session.id).exists());
    }

    #[test]
    fn manual_agent_and_prompt_share_one_input() {
        let ws = TestWorkspace::new().expect("workspace");
        let session = ws.session("Demo").expect("session");
        ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");
        let input = OperatorInput::new(Cursor::new("fail mystery\nskip\ndone\n"));
        let agent = ManualAgent::new(input.clone());
        let mut decider = PromptDecider::new(input);

        let outcome = run_build_loop(
            &ws.ctx,
            &session,
            &agent,
            &RecordingSleeper::default(),
            &mut decider,
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(outcome.skipped, vec!["A"]);
        assert_eq!(outcome.completed, vec!["B"]);
        assert_eq!(
            ws.read_plan(&session).expect("plan"),
            "- [x] A (SKIPPED)\n- [x] B\n"
        );
    }

    #[test]
    fn prompt_decider_parses_answers() {
        let failure = IterationResult::failed("boom", "", std::time::Duration::ZERO);
        let mut decider = PromptDecider::new(OperatorInput::new(Cursor::new("what\nr\n")));
        assert_eq!(decider.decide("A", &failure), FailureDecision::Retry);
        let mut decider = PromptDecider::new(OperatorInput::new(Cursor::new("skip\n")));
        assert_eq!(decider.decide("A", &failure), FailureDecision::Skip);
        let mut decider = PromptDecider::new(OperatorInput::new(Cursor::new("")));
        assert_eq!(decider.decide("A", &failure), FailureDecision::Stop);
    }
}
