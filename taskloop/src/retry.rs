//! Retry controller: bounded exponential backoff around one unit of work.

use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::backoff::BackoffPolicy;
use crate::core::classifier::Classifier;
use crate::core::types::{ErrorKind, IterationResult};

/// Granularity at which a backoff sleep notices cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Blocking wait between attempts.
pub trait Sleeper {
    /// Wait for `duration`. Returns false if `cancel` fired first.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Sleeps on the current thread in short slices.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Final result of a retried unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    /// Failures carry their classification.
    pub result: IterationResult,
    pub attempts: u32,
}

/// Runs a unit of work, retrying transient failures with backoff.
///
/// Success and cancellation return at once. Fatal and critical failures are
/// never retried. `Unknown` failures are retried only when `retry_unknown`
/// is set. After the attempt budget is spent the last failure is returned.
pub struct RetryController<'a, S: Sleeper> {
    policy: BackoffPolicy,
    classifier: &'a Classifier,
    retry_unknown: bool,
    sleeper: &'a S,
    cancel: &'a CancellationToken,
}

impl<'a, S: Sleeper> RetryController<'a, S> {
    pub fn new(
        policy: BackoffPolicy,
        classifier: &'a Classifier,
        retry_unknown: bool,
        sleeper: &'a S,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            policy,
            classifier,
            retry_unknown,
            sleeper,
            cancel,
        }
    }

    /// Execute `unit`, which receives the 1-based attempt number.
    pub fn execute<F>(&self, mut unit: F) -> RetryReport
    where
        F: FnMut(u32) -> IterationResult,
    {
        let mut current = self.policy.base_delay;
        let mut attempt = 1u32;
        loop {
            let mut result = unit(attempt);
            if result.is_success() || result.is_cancelled() {
                return RetryReport {
                    result,
                    attempts: attempt,
                };
            }

            let classification = self
                .classifier
                .classify_layered(result.raw_error().unwrap_or_default(), result.output_tail());
            let kind = classification.kind;
            let retry_after = classification.retry_after;
            debug!(attempt, %kind, message = %classification.message, "unit of work failed");
            result.classification = Some(classification);

            let retryable = match kind {
                ErrorKind::Transient => true,
                ErrorKind::Unknown => self.retry_unknown,
                ErrorKind::Fatal | ErrorKind::Critical => false,
            };
            if !retryable || attempt >= self.policy.max_attempts {
                return RetryReport {
                    result,
                    attempts: attempt,
                };
            }

            let wait = self.policy.wait(current, retry_after);
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                wait_secs = wait.as_secs_f64(),
                %kind,
                "retrying after failure"
            );
            if !self.sleeper.sleep(wait, self.cancel) {
                debug!(attempt, "cancelled during backoff");
                return RetryReport {
                    result: IterationResult::cancelled(result.output, result.duration),
                    attempts: attempt,
                };
            }
            current = self.policy.grow(current);
            attempt += 1;
        }
    }
}
