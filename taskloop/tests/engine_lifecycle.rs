//! Engine-level lifecycle scenarios.
//!
//! These drive `Engine::run` end to end against a temp workspace with a
//! scripted agent, and assert on the plan file and checkpoint bytes on disk.

use std::fs;
use std::time::Duration;

use taskloop::build_loop::FailureDecision;
use taskloop::core::classifier::{Classifier, RuleTables};
use taskloop::core::types::Phase;
use taskloop::engine::{Engine, Mode, RunOutcome};
use taskloop::exit_codes;
use taskloop::test_support::{
    RecordingSleeper, ScriptedAgent, ScriptedDecider, ScriptedRun, TestWorkspace,
};

/// Transient rules without retry-after hints, so the backoff schedule is the
/// configured one.
const HINTLESS_RULES: &str = r#"
[[fatal]]
pattern = 'quota exceeded'
message = "Quota exhausted"
resumable = true

[[transient]]
pattern = 'connection reset'
message = "Connection reset"
"#;

fn hintless_workspace() -> TestWorkspace {
    let mut ws = TestWorkspace::new().expect("workspace");
    let tables = RuleTables::from_toml_str(HINTLESS_RULES).expect("rules");
    ws.ctx.classifier = Classifier::new(&tables).expect("compile rules");
    ws
}

/// Plan `[A, B]`: A succeeds, then B fails transiently three times.
///
/// ```text
/// run 1 (max_iterations=1): A ok            -> LimitReached, checkpoint iteration=1
/// run 2:                    B x3 (5s, 10s)  -> Exhausted("B"), nothing written
/// ```
#[test]
fn transient_exhaustion_leaves_plan_and_checkpoint_as_after_last_success() {
    let mut ws = hintless_workspace();
    let session = ws.session("Scenario").expect("session");
    ws.write_plan(&session, "# Plan\n\n- [ ] A\n- [ ] B\n").expect("plan");
    let checkpoint_path = ws.ctx.checkpoints().path(&session.id);

    ws.ctx.max_iterations = 1;
    let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("did A")]);
    let mut decider = ScriptedDecider::new(Vec::new());
    let outcome = Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Build)
        .expect("run 1");
    assert_eq!(outcome, RunOutcome::LimitReached { pending: 1 });
    assert_eq!(outcome.exit_code(), exit_codes::LIMIT_REACHED);

    let plan_after_a = ws.read_plan(&session).expect("plan");
    assert_eq!(plan_after_a, "# Plan\n\n- [x] A\n- [ ] B\n");
    let checkpoint_after_a = fs::read(&checkpoint_path).expect("checkpoint bytes");
    let checkpoint = ws.ctx.checkpoints().load(&session.id).expect("checkpoint");
    assert_eq!(checkpoint.iteration, 1);
    assert_eq!(checkpoint.current_task, "A");
    assert_eq!(checkpoint.phase, Phase::Building);
    assert!(checkpoint.is_completed_state);

    ws.ctx.max_iterations = 0;
    let agent = ScriptedAgent::new(vec![
        ScriptedRun::fail("read ECONNRESET: connection reset by peer"),
        ScriptedRun::fail("connection reset"),
        ScriptedRun::fail("connection reset"),
        ScriptedRun::succeed("never reached"),
    ]);
    let sleeper = RecordingSleeper::default();
    let mut decider = ScriptedDecider::new(vec![FailureDecision::Stop]);
    let outcome = Engine::new(&ws.ctx, &agent, &sleeper, &mut decider)
        .run(&session, Mode::Build)
        .expect("run 2");

    assert_eq!(
        outcome,
        RunOutcome::Exhausted {
            unit: "B".to_string()
        }
    );
    assert_eq!(outcome.exit_code(), exit_codes::EXHAUSTED);
    assert_eq!(agent.calls(), 3);
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_secs(5), Duration::from_secs(10)]
    );
    assert_eq!(decider.seen(), ["B"]);
    assert_eq!(ws.read_plan(&session).expect("plan"), plan_after_a);
    assert_eq!(fs::read(&checkpoint_path).expect("checkpoint bytes"), checkpoint_after_a);
}

#[test]
fn cancellation_mid_iteration_leaves_checkpoint_byte_identical() {
    let mut ws = hintless_workspace();
    let session = ws.session("Cancel").expect("session");
    ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");

    ws.ctx.max_iterations = 1;
    let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("did A")]);
    let mut decider = ScriptedDecider::new(Vec::new());
    Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Build)
        .expect("run 1");
    let checkpoint_path = ws.ctx.checkpoints().path(&session.id);
    let before = fs::read(&checkpoint_path).expect("checkpoint bytes");

    ws.ctx.max_iterations = 0;
    let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("did B").cancelling(&ws.ctx.cancel)]);
    let outcome = Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Auto)
        .expect("run 2");

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(outcome.exit_code(), exit_codes::CANCELLED);
    assert_eq!(fs::read(&checkpoint_path).expect("checkpoint bytes"), before);
    assert_eq!(ws.read_plan(&session).expect("plan"), "- [x] A\n- [ ] B\n");
}

#[test]
fn fatal_halt_inside_build_loop_preserves_last_checkpoint() {
    let mut ws = hintless_workspace();
    let session = ws.session("Quota").expect("session");
    ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");

    let agent = ScriptedAgent::new(vec![
        ScriptedRun::succeed("did A"),
        ScriptedRun::fail("Error 429: quota exceeded"),
    ]);
    let sleeper = RecordingSleeper::default();
    let mut decider = ScriptedDecider::new(Vec::new());
    let outcome = Engine::new(&ws.ctx, &agent, &sleeper, &mut decider)
        .run(&session, Mode::Build)
        .expect("run");

    let RunOutcome::Halted(classification) = &outcome else {
        panic!("expected halt, got {outcome:?}");
    };
    assert!(classification.resumable);
    assert_eq!(agent.calls(), 2);
    assert!(sleeper.recorded().is_empty());
    assert!(decider.seen().is_empty());

    let checkpoint = ws.ctx.checkpoints().load(&session.id).expect("checkpoint");
    assert_eq!(checkpoint.iteration, 1);
    assert_eq!(checkpoint.current_task, "A");
    assert!(ws.ctx.checkpoints().can_resume(&session.id));

    let progress = fs::read_to_string(session.progress_log(&ws.ctx.paths).path()).expect("progress");
    assert!(progress.contains("halted"));
}

#[test]
fn continue_resumes_at_the_next_iteration_number() {
    let mut ws = hintless_workspace();
    let session = ws.session("Resume").expect("session");
    ws.write_plan(&session, "- [ ] A\n- [ ] B\n- [ ] C\n").expect("plan");

    ws.ctx.max_iterations = 1;
    let agent = ScriptedAgent::new(vec![ScriptedRun::succeed("did A")]);
    let mut decider = ScriptedDecider::new(Vec::new());
    Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Build)
        .expect("run 1");
    assert_eq!(
        ws.ctx.checkpoints().load(&session.id).map(|c| c.next_iteration()),
        Some(2)
    );

    ws.ctx.max_iterations = 0;
    let agent = ScriptedAgent::new(vec![
        ScriptedRun::succeed("did B"),
        ScriptedRun::succeed("did C <promise>COMPLETE</promise>"),
    ]);
    let outcome = Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Continue)
        .expect("run 2");
    assert_eq!(outcome, RunOutcome::Complete);

    let iterations = ws.ctx.paths.session(&session.id).iterations_dir;
    let meta: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(iterations.join("2").join("meta.json")).expect("meta"),
    )
    .expect("json");
    assert_eq!(meta["iteration"], 2);
    assert_eq!(meta["task"], "B");
    assert!(iterations.join("3").join("meta.json").exists());

    let checkpoint = ws.ctx.checkpoints().load(&session.id).expect("checkpoint");
    assert_eq!(checkpoint.phase, Phase::Complete);
    assert_eq!(checkpoint.iteration, 3);
    assert!(!ws.ctx.checkpoints().can_resume(&session.id));
}

#[test]
fn completion_claim_with_pending_tasks_is_ignored() {
    let ws = hintless_workspace();
    let session = ws.session("Claims").expect("session");
    ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");

    let agent = ScriptedAgent::new(vec![
        ScriptedRun::succeed("all done! <promise>COMPLETE</promise>"),
        ScriptedRun::succeed("did B"),
    ]);
    let mut decider = ScriptedDecider::new(Vec::new());
    let outcome = Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Build)
        .expect("run");

    assert_eq!(outcome, RunOutcome::Complete);
    assert_eq!(agent.calls(), 2);
    assert_eq!(ws.read_plan(&session).expect("plan"), "- [x] A\n- [x] B\n");
}

#[test]
fn skip_marks_poison_task_and_moves_on() {
    let ws = hintless_workspace();
    let session = ws.session("Poison").expect("session");
    ws.write_plan(&session, "- [ ] A\n- [ ] B\n").expect("plan");

    let agent = ScriptedAgent::new(vec![
        ScriptedRun::fail("segfault in tool"),
        ScriptedRun::succeed("did B"),
    ]);
    let mut decider = ScriptedDecider::new(vec![FailureDecision::Skip]);
    let outcome = Engine::new(&ws.ctx, &agent, &RecordingSleeper::default(), &mut decider)
        .run(&session, Mode::Build)
        .expect("run");

    assert_eq!(outcome, RunOutcome::Complete);
    assert_eq!(
        ws.read_plan(&session).expect("plan"),
        "- [x] A (SKIPPED)\n- [x] B\n"
    );
}

#[test]
fn removing_the_active_session_clears_the_pointer() {
    let ws = TestWorkspace::new().expect("workspace");
    let session = ws.session("Doomed").expect("session");
    assert_eq!(
        ws.ctx.registry.get_active().expect("active").map(|s| s.id),
        Some(session.id.clone())
    );

    ws.ctx.registry.remove(&session.id).expect("remove");

    assert!(ws.ctx.registry.get_active().expect("active").is_none());
    assert!(ws.ctx.registry.get(&session.id).expect("get").is_none());
    assert!(ws.ctx.checkpoints().load(&session.id).is_none());
}
