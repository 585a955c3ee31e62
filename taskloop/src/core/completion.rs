//! Completion-signal corroboration.
//!
//! The agent is asked to print a sentinel when it believes all work is done.
//! The sentinel is advisory: the plan's pending count decides.

/// How a completion claim relates to the plan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    /// Signal present and no pending tasks.
    Confirmed,
    /// Signal present but tasks remain; ignored.
    FalsePositive,
    /// No pending tasks although the agent did not claim completion.
    Unsignalled,
    /// No signal and tasks remain.
    InProgress,
}

impl CompletionCheck {
    pub fn is_complete(self) -> bool {
        matches!(self, CompletionCheck::Confirmed | CompletionCheck::Unsignalled)
    }
}

pub fn check_completion(output: &str, signal: &str, pending: usize) -> CompletionCheck {
    let claimed = !signal.is_empty() && output.contains(signal);
    match (claimed, pending == 0) {
        (true, true) => CompletionCheck::Confirmed,
        (true, false) => CompletionCheck::FalsePositive,
        (false, true) => CompletionCheck::Unsignalled,
        (false, false) => CompletionCheck::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNAL: &str = "<promise>COMPLETE</promise>";

    #[test]
    fn uncorroborated_signal_is_ignored() {
        let output = "I will print <promise>COMPLETE</promise> when everything is done.";
        let check = check_completion(output, SIGNAL, 2);
        assert_eq!(check, CompletionCheck::FalsePositive);
        assert!(!check.is_complete());
    }

    #[test]
    fn pending_count_is_authoritative() {
        assert_eq!(check_completion("done", SIGNAL, 0), CompletionCheck::Unsignalled);
        assert!(check_completion("done", SIGNAL, 0).is_complete());
        assert_eq!(
            check_completion(SIGNAL, SIGNAL, 0),
            CompletionCheck::Confirmed
        );
    }
}
