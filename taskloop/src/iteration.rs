//! One unit of work: render artifacts, invoke the agent through the retry
//! controller, and record what happened.

use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::context::EngineContext;
use crate::core::types::{ErrorPayload, IterationResult};
use crate::io::agent::{Agent, AgentExit, AgentRequest};
use crate::io::iteration_log::{IterationMeta, IterationPaths, UnitKind};
use crate::io::registry::Session;
use crate::retry::{RetryController, RetryReport, Sleeper};

/// What to run.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub kind: UnitKind,
    /// Artifacts directory name under `iterations/`.
    pub label: String,
    pub prompt: String,
    /// Build iterations carry their number and task.
    pub iteration: Option<u32>,
    pub task: Option<String>,
}

impl UnitOfWork {
    pub fn build(iteration: u32, task: &str, prompt: String) -> Self {
        Self {
            kind: UnitKind::Build,
            label: iteration.to_string(),
            prompt,
            iteration: Some(iteration),
            task: Some(task.to_string()),
        }
    }

    /// Phase-level unit (plan, spec, agents), labelled by kind and start time.
    pub fn phase(kind: UnitKind, prompt: String) -> Self {
        Self {
            kind,
            label: format!("{}-{}", kind.as_str(), Utc::now().format("%Y%m%d-%H%M%S")),
            prompt,
            iteration: None,
            task: None,
        }
    }
}

/// Run one unit of work to a final, classified result.
///
/// Cancellation observed after the agent exits but before the caller mutates
/// anything turns a success into `Cancelled`.
#[instrument(skip_all, fields(session_id = %session.id, unit = unit.kind.as_str(), label = %unit.label))]
pub fn run_unit<A: Agent, S: Sleeper>(
    ctx: &EngineContext,
    session: &Session,
    agent: &A,
    sleeper: &S,
    unit: &UnitOfWork,
) -> anyhow::Result<RetryReport> {
    let artifacts = IterationPaths::new(&ctx.paths.session(&session.id), &unit.label);
    artifacts.prepare(&unit.prompt)?;

    let request = AgentRequest {
        workdir: ctx.paths.root.clone(),
        prompt: unit.prompt.clone(),
        model: ctx.model.clone(),
        verbose: ctx.verbose,
        artifacts_dir: artifacts.dir.clone(),
        cancel: ctx.cancel.clone(),
    };

    let started_at = Utc::now();
    let started = Instant::now();
    let controller = RetryController::new(
        ctx.config.retry.policy(),
        &ctx.classifier,
        ctx.config.retry.retry_unknown,
        sleeper,
        &ctx.cancel,
    );
    let mut report = controller.execute(|attempt| {
        debug!(attempt, "invoking agent");
        invoke_once(agent, &request)
    });

    if report.result.is_success() && ctx.cancel.is_cancelled() {
        info!("cancellation requested after the agent finished; discarding result");
        report.result = IterationResult::cancelled(
            std::mem::take(&mut report.result.output),
            report.result.duration,
        );
    }

    let meta = IterationMeta {
        session_id: session.id.clone(),
        unit: unit.kind,
        iteration: unit.iteration,
        task: unit.task.clone(),
        attempts: report.attempts,
        outcome: outcome_label(&report.result),
        error: report.result.classification.as_ref().map(ErrorPayload::from),
        started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ended_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    // Artifacts are diagnostics; losing them must not lose the result.
    if let Err(err) = artifacts.write_meta(&meta) {
        warn!(err = %format!("{err:#}"), "failed to write iteration meta");
    }
    Ok(report)
}

fn invoke_once<A: Agent>(agent: &A, request: &AgentRequest) -> IterationResult {
    let started = Instant::now();
    if request.cancel.is_cancelled() {
        return IterationResult::cancelled("", started.elapsed());
    }
    match agent.invoke(request) {
        Ok(run) => match run.exit {
            AgentExit::Succeeded => IterationResult::succeeded(run.stdout, run.duration),
            AgentExit::Cancelled => IterationResult::cancelled(run.stdout, run.duration),
            AgentExit::Failed { .. } => {
                let raw = run.raw_error();
                IterationResult::failed(raw, run.stdout, run.duration)
            }
        },
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent could not be started");
            IterationResult::failed(format!("{err:#}"), "", started.elapsed())
        }
    }
}

fn outcome_label(result: &IterationResult) -> &'static str {
    if result.is_success() {
        "succeeded"
    } else if result.is_cancelled() {
        "cancelled"
    } else {
        "failed"
    }
}
