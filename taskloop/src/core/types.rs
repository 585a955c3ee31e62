//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the classifier, the retry
//! controller, the phase machine and the build loop. They carry no I/O and
//! serialize to the wire formats used by checkpoint records.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    SpecCreation,
    Planning,
    Building,
    Complete,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::SpecCreation => "spec_creation",
            Phase::Planning => "planning",
            Phase::Building => "building",
            Phase::Complete => "complete",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taxonomy entry assigned to a raw error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Needs out-of-band user action (quota, billing, credentials).
    Fatal,
    /// Expected to clear on its own; retried with backoff.
    Transient,
    /// Service-side outage signature.
    Critical,
    /// Matched no rule.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::Transient => "transient",
            ErrorKind::Critical => "critical",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Result of classifying one raw error string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    /// Human-readable explanation.
    pub message: String,
    /// Whether a session halted by this error may be resumed later.
    pub resumable: bool,
    /// Suggested wait before the next attempt (transient rules only).
    pub retry_after: Option<Duration>,
    /// The original error text.
    pub raw: String,
}

impl ErrorClassification {
    /// Classification used when no rule matched.
    pub fn unknown(raw: &str) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: "Unrecognized error".to_string(),
            resumable: true,
            retry_after: None,
            raw: raw.to_string(),
        }
    }

    /// Fatal and critical errors stop the loop instead of being retried.
    pub fn halts(&self) -> bool {
        matches!(self.kind, ErrorKind::Fatal | ErrorKind::Critical)
    }
}

/// Persisted form of an [`ErrorClassification`], tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ErrorPayload {
    Fatal {
        message: String,
        resumable: bool,
        raw: String,
    },
    Transient {
        message: String,
        resumable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
        raw: String,
    },
    Critical {
        message: String,
        resumable: bool,
        raw: String,
    },
    Unknown {
        message: String,
        resumable: bool,
        raw: String,
    },
}

impl ErrorPayload {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorPayload::Fatal { .. } => ErrorKind::Fatal,
            ErrorPayload::Transient { .. } => ErrorKind::Transient,
            ErrorPayload::Critical { .. } => ErrorKind::Critical,
            ErrorPayload::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn resumable(&self) -> bool {
        match self {
            ErrorPayload::Fatal { resumable, .. }
            | ErrorPayload::Transient { resumable, .. }
            | ErrorPayload::Critical { resumable, .. }
            | ErrorPayload::Unknown { resumable, .. } => *resumable,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Fatal { message, .. }
            | ErrorPayload::Transient { message, .. }
            | ErrorPayload::Critical { message, .. }
            | ErrorPayload::Unknown { message, .. } => message,
        }
    }
}

impl From<&ErrorClassification> for ErrorPayload {
    fn from(c: &ErrorClassification) -> Self {
        let message = c.message.clone();
        let resumable = c.resumable;
        let raw = c.raw.clone();
        match c.kind {
            ErrorKind::Fatal => ErrorPayload::Fatal {
                message,
                resumable,
                raw,
            },
            ErrorKind::Transient => ErrorPayload::Transient {
                message,
                resumable,
                retry_after_secs: c.retry_after.map(|d| d.as_secs()),
                raw,
            },
            ErrorKind::Critical => ErrorPayload::Critical {
                message,
                resumable,
                raw,
            },
            ErrorKind::Unknown => ErrorPayload::Unknown {
                message,
                resumable,
                raw,
            },
        }
    }
}

impl From<&ErrorPayload> for ErrorClassification {
    fn from(payload: &ErrorPayload) -> Self {
        let (message, resumable, raw, retry_after) = match payload {
            ErrorPayload::Transient {
                message,
                resumable,
                retry_after_secs,
                raw,
            } => (message, *resumable, raw, retry_after_secs.map(Duration::from_secs)),
            ErrorPayload::Fatal {
                message,
                resumable,
                raw,
            }
            | ErrorPayload::Critical {
                message,
                resumable,
                raw,
            }
            | ErrorPayload::Unknown {
                message,
                resumable,
                raw,
            } => (message, *resumable, raw, None),
        };
        Self {
            kind: payload.kind(),
            message: message.clone(),
            resumable,
            retry_after,
            raw: raw.clone(),
        }
    }
}

/// How one unit of work ended, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationStatus {
    Succeeded,
    /// The user asked to stop; never retried.
    Cancelled,
    Failed {
        raw_error: String,
    },
}

/// Outcome of one unit of work (one agent invocation for one task).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationResult {
    pub status: IterationStatus,
    /// Attached by the retry controller when `status` is `Failed`.
    pub classification: Option<ErrorClassification>,
    /// Raw agent output (stdout).
    pub output: String,
    pub duration: Duration,
}

impl IterationResult {
    pub fn succeeded(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: IterationStatus::Succeeded,
            classification: None,
            output: output.into(),
            duration,
        }
    }

    pub fn cancelled(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: IterationStatus::Cancelled,
            classification: None,
            output: output.into(),
            duration,
        }
    }

    pub fn failed(
        raw_error: impl Into<String>,
        output: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            status: IterationStatus::Failed {
                raw_error: raw_error.into(),
            },
            classification: None,
            output: output.into(),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == IterationStatus::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == IterationStatus::Cancelled
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == Some(ErrorKind::Fatal)
    }

    pub fn is_critical(&self) -> bool {
        self.kind() == Some(ErrorKind::Critical)
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.classification.as_ref().map(|c| c.kind)
    }

    pub fn raw_error(&self) -> Option<&str> {
        match &self.status {
            IterationStatus::Failed { raw_error } => Some(raw_error),
            _ => None,
        }
    }

    /// Last [`OUTPUT_TAIL_CHARS`] characters of the agent's output.
    pub fn output_tail(&self) -> &str {
        tail_chars(self.output.trim(), OUTPUT_TAIL_CHARS)
    }
}

/// Characters of agent output consulted when the error text is unrecognised.
pub const OUTPUT_TAIL_CHARS: usize = 2_000;

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serializes_as_snake_case() {
        let json = serde_json::to_string(&Phase::SpecCreation).expect("serialize");
        assert_eq!(json, "\"spec_creation\"");
        assert_eq!(Phase::SpecCreation.to_string(), "spec_creation");
    }

    #[test]
    fn error_payload_is_tagged_by_kind() {
        let classification = ErrorClassification {
            kind: ErrorKind::Transient,
            message: "Rate limited".to_string(),
            resumable: true,
            retry_after: Some(Duration::from_secs(30)),
            raw: "429 Too Many Requests".to_string(),
        };
        let payload = ErrorPayload::from(&classification);
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["kind"], "transient");
        assert_eq!(value["retryAfterSecs"], 30);
        assert_eq!(value["raw"], "429 Too Many Requests");
        assert_eq!(payload.kind(), ErrorKind::Transient);
        assert!(payload.resumable());
        assert_eq!(ErrorClassification::from(&payload), classification);
    }

    #[test]
    fn failed_result_exposes_raw_error() {
        let result = IterationResult::failed("boom", "", Duration::ZERO);
        assert_eq!(result.raw_error(), Some("boom"));
        assert!(!result.is_success());
        assert_eq!(result.kind(), None);
    }

    #[test]
    fn output_tail_keeps_the_end_of_long_output() {
        let long = format!("{}é", "x".repeat(OUTPUT_TAIL_CHARS + 10));
        let result = IterationResult::failed("boom", long, Duration::ZERO);
        assert_eq!(result.output_tail().chars().count(), OUTPUT_TAIL_CHARS);
        assert!(result.output_tail().ends_with('é'));

        let short = IterationResult::failed("boom", "  partial work\n", Duration::ZERO);
        assert_eq!(short.output_tail(), "partial work");
    }
}
