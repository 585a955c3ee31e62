//! Session phase determination and the phase transition function.

use thiserror::Error;

use crate::core::plan::TaskCounts;
use crate::core::types::{ErrorClassification, Phase};

/// Snapshot of everything phase determination depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInputs {
    /// A configured spec source exists and holds at least one non-template document.
    pub spec_source_available: bool,
    pub tasks: TaskCounts,
}

/// Decide which phase a session should run next.
///
/// Pure function of plan contents and spec configuration; callers re-evaluate
/// it every time they re-enter the loop, so a completed plan that gains new
/// tasks through replanning goes back to `Building`.
pub fn determine_next_phase(inputs: &PhaseInputs) -> Phase {
    let TaskCounts { total, pending } = inputs.tasks;
    if pending > 0 {
        return Phase::Building;
    }
    if total > 0 {
        return Phase::Complete;
    }
    if inputs.spec_source_available {
        Phase::Planning
    } else {
        Phase::SpecCreation
    }
}

/// Events that move a session between phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// No usable spec source is configured.
    NoSpecSource,
    /// A spec source became available.
    SpecAvailable,
    /// Planning finished with this many pending tasks.
    PlanProduced { pending: usize },
    /// The pending count reached zero.
    AllTasksComplete { total: usize },
    /// A fatal or critical classification stopped the current phase.
    Halted(ErrorClassification),
    /// The caller decided to resume after inspecting resumability.
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid phase transition from {from} on {event}")]
    Invalid { from: Phase, event: &'static str },
    #[error("session halted with a non-resumable error: {message}")]
    NotResumable { message: String },
}

/// Explicit state machine over [`Phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseMachine {
    current: Phase,
    /// Last non-error phase, restored on resume.
    previous: Option<Phase>,
    error: Option<ErrorClassification>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::starting_at(Phase::Idle)
    }

    /// Rebuild a machine from a persisted phase (e.g. a checkpoint).
    pub fn starting_at(phase: Phase) -> Self {
        Self {
            current: phase,
            previous: None,
            error: None,
        }
    }

    /// Rebuild a machine that is halted in `Error`, resumable into `previous`.
    pub fn halted(previous: Phase, error: ErrorClassification) -> Self {
        Self {
            current: Phase::Error,
            previous: Some(previous),
            error: Some(error),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn error(&self) -> Option<&ErrorClassification> {
        self.error.as_ref()
    }

    /// `Complete`, or `Error` with a non-resumable classification.
    pub fn is_terminal(&self) -> bool {
        match self.current {
            Phase::Complete => true,
            Phase::Error => self.error.as_ref().is_some_and(|e| !e.resumable),
            _ => false,
        }
    }

    /// Apply an event. Every (phase, event) pair is handled explicitly.
    pub fn apply(&mut self, event: PhaseEvent) -> Result<Phase, TransitionError> {
        use PhaseEvent as E;
        let from = self.current;
        let next = match (from, event) {
            (Phase::Error, E::Resume) => {
                if let Some(error) = self.error.as_ref().filter(|e| !e.resumable) {
                    return Err(TransitionError::NotResumable {
                        message: error.message.clone(),
                    });
                }
                self.error = None;
                self.previous.unwrap_or(Phase::Idle)
            }
            (Phase::Error, E::Halted(error)) => {
                self.error = Some(error);
                Phase::Error
            }
            (Phase::Complete, E::Halted(_)) => {
                return Err(TransitionError::Invalid {
                    from,
                    event: "halted",
                });
            }
            (_, E::Halted(error)) => {
                self.previous = Some(from);
                self.error = Some(error);
                Phase::Error
            }
            (Phase::Idle, E::NoSpecSource) => Phase::SpecCreation,
            (Phase::Idle | Phase::SpecCreation, E::SpecAvailable) => Phase::Planning,
            (Phase::SpecCreation, E::NoSpecSource) => Phase::SpecCreation,
            // Zero pending tasks leaves the session in Planning; re-offering spec
            // creation is the caller's decision.
            (Phase::Planning, E::PlanProduced { pending }) => {
                if pending > 0 {
                    Phase::Building
                } else {
                    Phase::Planning
                }
            }
            // Idle and Planning reach Complete when a session is re-evaluated with
            // a finished plan.
            (Phase::Idle | Phase::Planning | Phase::Building, E::AllTasksComplete { total })
                if total > 0 =>
            {
                Phase::Complete
            }
            // Replanning a finished or in-progress plan.
            (Phase::Complete | Phase::Building, E::SpecAvailable) => Phase::Planning,
            (Phase::Idle, E::PlanProduced { pending }) if pending > 0 => Phase::Building,
            (_, event) => {
                return Err(TransitionError::Invalid {
                    from,
                    event: event_name(&event),
                });
            }
        };
        self.current = next;
        Ok(next)
    }
}

fn event_name(event: &PhaseEvent) -> &'static str {
    match event {
        PhaseEvent::NoSpecSource => "no_spec_source",
        PhaseEvent::SpecAvailable => "spec_available",
        PhaseEvent::PlanProduced { .. } => "plan_produced",
        PhaseEvent::AllTasksComplete { .. } => "all_tasks_complete",
        PhaseEvent::Halted(_) => "halted",
        PhaseEvent::Resume => "resume",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    fn inputs(spec: bool, total: usize, pending: usize) -> PhaseInputs {
        PhaseInputs {
            spec_source_available: spec,
            tasks: TaskCounts { total, pending },
        }
    }

    fn classification(kind: ErrorKind, resumable: bool) -> ErrorClassification {
        ErrorClassification {
            kind,
            message: format!("{kind} error"),
            resumable,
            retry_after: None,
            raw: "raw".to_string(),
        }
    }

    #[test]
    fn next_phase_follows_plan_and_spec_state() {
        assert_eq!(determine_next_phase(&inputs(false, 0, 0)), Phase::SpecCreation);
        assert_eq!(determine_next_phase(&inputs(true, 0, 0)), Phase::Planning);
        assert_eq!(determine_next_phase(&inputs(true, 3, 1)), Phase::Building);
        assert_eq!(determine_next_phase(&inputs(false, 3, 1)), Phase::Building);
        assert_eq!(determine_next_phase(&inputs(true, 3, 0)), Phase::Complete);
    }

    #[test]
    fn happy_path_walks_every_phase() {
        let mut machine = PhaseMachine::new();
        assert_eq!(machine.apply(PhaseEvent::NoSpecSource), Ok(Phase::SpecCreation));
        assert_eq!(machine.apply(PhaseEvent::SpecAvailable), Ok(Phase::Planning));
        assert_eq!(machine.apply(PhaseEvent::PlanProduced { pending: 2 }), Ok(Phase::Building));
        assert_eq!(
            machine.apply(PhaseEvent::AllTasksComplete { total: 2 }),
            Ok(Phase::Complete)
        );
        assert!(machine.is_terminal());
    }

    #[test]
    fn zero_task_plan_stays_in_planning() {
        let mut machine = PhaseMachine::starting_at(Phase::Planning);
        assert_eq!(machine.apply(PhaseEvent::PlanProduced { pending: 0 }), Ok(Phase::Planning));
    }

    #[test]
    fn completion_requires_tasks() {
        let mut machine = PhaseMachine::starting_at(Phase::Building);
        let err = machine.apply(PhaseEvent::AllTasksComplete { total: 0 }).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { from: Phase::Building, .. }));
        assert_eq!(machine.current(), Phase::Building);
    }

    #[test]
    fn halt_then_resume_returns_to_previous_phase() {
        let mut machine = PhaseMachine::starting_at(Phase::Building);
        machine
            .apply(PhaseEvent::Halted(classification(ErrorKind::Critical, true)))
            .expect("halt");
        assert_eq!(machine.current(), Phase::Error);
        assert!(!machine.is_terminal());
        assert_eq!(machine.apply(PhaseEvent::Resume), Ok(Phase::Building));
        assert!(machine.error().is_none());
    }

    #[test]
    fn non_resumable_halt_refuses_resume() {
        let mut machine = PhaseMachine::starting_at(Phase::Planning);
        machine
            .apply(PhaseEvent::Halted(classification(ErrorKind::Fatal, false)))
            .expect("halt");
        assert!(machine.is_terminal());
        let err = machine.apply(PhaseEvent::Resume).unwrap_err();
        assert!(matches!(err, TransitionError::NotResumable { .. }));
        assert_eq!(machine.current(), Phase::Error);
        assert!(machine.error().is_some());
    }

    #[test]
    fn finished_plan_completes_from_idle() {
        let mut machine = PhaseMachine::new();
        assert_eq!(
            machine.apply(PhaseEvent::AllTasksComplete { total: 1 }),
            Ok(Phase::Complete)
        );
    }

    #[test]
    fn replanning_a_complete_session_is_allowed() {
        let mut machine = PhaseMachine::starting_at(Phase::Complete);
        assert_eq!(machine.apply(PhaseEvent::SpecAvailable), Ok(Phase::Planning));
    }
}
