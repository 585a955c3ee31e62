//! Durable per-session checkpoints (`.taskloop/checkpoints/<session-id>.json`).
//!
//! A checkpoint is only written after a unit of work succeeded or a phase
//! boundary was entered, so the latest record is always safe to resume from.
//! Checkpoint failures degrade resumability; they never stop the loop.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, SecondsFormat, Utc};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{ErrorPayload, Phase};
use crate::io::config::write_atomic;

pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/checkpoint.v1.schema.json"
));

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(CHECKPOINT_SCHEMA).expect("checkpoint schema should be valid json");
    jsonschema::validator_for(&schema).expect("checkpoint schema should compile")
});

/// Snapshot of orchestration progress for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub session_id: String,
    pub phase: Phase,
    /// Last completed iteration; the next attempt is `iteration + 1`.
    pub iteration: u32,
    /// Task completed by `iteration` (empty at phase boundaries).
    pub current_task: String,
    /// Derived from the plan at write time; the plan stays authoritative.
    pub completed_tasks: Vec<String>,
    pub timestamp: String,
    pub timestamp_utc: String,
    pub error: Option<ErrorPayload>,
    pub can_resume: bool,
    #[serde(default)]
    pub is_completed_state: bool,
}

impl Checkpoint {
    pub fn new(
        session_id: &str,
        phase: Phase,
        iteration: u32,
        current_task: &str,
        completed_tasks: Vec<String>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            session_id: session_id.to_string(),
            phase,
            iteration,
            current_task: current_task.to_string(),
            completed_tasks,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            error: None,
            can_resume: true,
            is_completed_state: false,
        }
    }

    /// Mark this record as written right after a successful unit of work.
    pub fn completed_state(mut self) -> Self {
        self.is_completed_state = true;
        self
    }

    /// Record a phase-level halt; resumability follows the error.
    pub fn with_error(mut self, error: ErrorPayload) -> Self {
        self.phase = Phase::Error;
        self.can_resume = error.resumable();
        self.error = Some(error);
        self
    }

    /// Terminal record written when every task is done.
    pub fn terminal(mut self) -> Self {
        self.phase = Phase::Complete;
        self.can_resume = false;
        self.is_completed_state = true;
        self
    }

    /// Iteration number a resumed loop attempts next.
    pub fn next_iteration(&self) -> u32 {
        self.iteration + 1
    }

    /// Resumable unless complete, or halted by a non-resumable error.
    pub fn is_resumable(&self) -> bool {
        match self.phase {
            Phase::Complete => false,
            Phase::Error => self.can_resume && self.error.as_ref().is_none_or(ErrorPayload::resumable),
            _ => true,
        }
    }
}

/// Checkpoint persistence keyed by session id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Write a checkpoint. Returns false (and logs) on any failure.
    pub fn save(&self, checkpoint: &Checkpoint) -> bool {
        let path = self.path(&checkpoint.session_id);
        debug!(
            path = %path.display(),
            session_id = %checkpoint.session_id,
            phase = %checkpoint.phase,
            iteration = checkpoint.iteration,
            "writing checkpoint"
        );
        match write_checkpoint(&path, checkpoint) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "checkpoint save failed");
                false
            }
        }
    }

    /// Load a checkpoint. Missing, unreadable or invalid records are `None`.
    pub fn load(&self, session_id: &str) -> Option<Checkpoint> {
        let path = self.path(session_id);
        if !path.exists() {
            return None;
        }
        match read_checkpoint(&path) {
            Ok(checkpoint) => {
                debug!(session_id, iteration = checkpoint.iteration, phase = %checkpoint.phase, "checkpoint loaded");
                Some(checkpoint)
            }
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "ignoring unusable checkpoint");
                None
            }
        }
    }

    /// Best-effort, idempotent removal.
    pub fn delete(&self, session_id: &str) {
        let path = self.path(session_id);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "checkpoint deleted"),
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), err = %err, "checkpoint delete failed"),
        }
    }

    pub fn can_resume(&self, session_id: &str) -> bool {
        self.load(session_id)
            .is_some_and(|checkpoint| checkpoint.is_resumable())
    }
}

fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    let messages: Vec<String> = VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "checkpoint schema validation failed: {}",
            messages.join("; ")
        ));
    }
    serde_json::from_value(value)
        .with_context(|| format!("deserialize checkpoint {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ErrorClassification, ErrorKind};

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path().join("checkpoints"));
        (temp, store)
    }

    fn building(iteration: u32) -> Checkpoint {
        Checkpoint::new(
            "demo-20260101-000000",
            Phase::Building,
            iteration,
            "Add parser",
            vec!["Set up crate".to_string(), "Add parser".to_string()],
        )
        .completed_state()
    }

    fn payload(kind: ErrorKind, resumable: bool) -> ErrorPayload {
        ErrorPayload::from(&ErrorClassification {
            kind,
            message: "halted".to_string(),
            resumable,
            retry_after: None,
            raw: "raw".to_string(),
        })
    }

    #[test]
    fn save_creates_parent_and_loads_back() {
        let (_temp, store) = store();
        let checkpoint = building(2);
        assert!(store.save(&checkpoint));
        let loaded = store.load(&checkpoint.session_id).expect("load");
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.next_iteration(), 3);
    }

    #[test]
    fn saving_twice_is_idempotent() {
        let (_temp, store) = store();
        let checkpoint = building(1);
        assert!(store.save(&checkpoint));
        let first = fs::read(store.path(&checkpoint.session_id)).expect("read");
        assert!(store.save(&checkpoint));
        let second = fs::read(store.path(&checkpoint.session_id)).expect("read");
        assert_eq!(first, second);
        assert_eq!(store.load(&checkpoint.session_id), Some(checkpoint));
    }

    #[test]
    fn save_reports_failure_instead_of_erroring() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "file").expect("write");
        let store = CheckpointStore::new(blocker.join("checkpoints"));
        assert!(!store.save(&building(1)));
    }

    #[test]
    fn missing_checkpoint_loads_as_none_and_cannot_resume() {
        let (_temp, store) = store();
        assert_eq!(store.load("nope-20260101-000000"), None);
        assert!(!store.can_resume("nope-20260101-000000"));
    }

    #[test]
    fn corrupt_or_foreign_records_load_as_none() {
        let (_temp, store) = store();
        let path = store.path("bad-20260101-000000");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");
        assert_eq!(store.load("bad-20260101-000000"), None);

        let mut value = serde_json::to_value(building(1)).expect("value");
        value["version"] = Value::from(99);
        fs::write(&path, serde_json::to_string(&value).expect("json")).expect("write");
        assert_eq!(store.load("bad-20260101-000000"), None);
    }

    #[test]
    fn can_resume_follows_phase_and_error() {
        let (_temp, store) = store();
        let id = "demo-20260101-000000";

        assert!(store.save(&building(1)));
        assert!(store.can_resume(id));

        assert!(store.save(&building(1).terminal()));
        assert!(!store.can_resume(id));

        assert!(store.save(&building(1).with_error(payload(ErrorKind::Fatal, false))));
        assert!(!store.can_resume(id));

        assert!(store.save(&building(1).with_error(payload(ErrorKind::Fatal, true))));
        assert!(store.can_resume(id));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_temp, store) = store();
        let checkpoint = building(1);
        assert!(store.save(&checkpoint));
        store.delete(&checkpoint.session_id);
        store.delete(&checkpoint.session_id);
        assert_eq!(store.load(&checkpoint.session_id), None);
    }

    #[test]
    fn serialized_record_uses_wire_field_names() {
        let value = serde_json::to_value(building(4)).expect("value");
        for key in [
            "version",
            "sessionId",
            "phase",
            "iteration",
            "currentTask",
            "completedTasks",
            "timestamp",
            "timestampUtc",
            "error",
            "canResume",
            "isCompletedState",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["phase"], "building");
        assert!(value["error"].is_null());
    }
}
