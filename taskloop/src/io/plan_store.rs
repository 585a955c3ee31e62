//! Plan document load/save helpers.
//!
//! Every operation re-reads the file so edits made by a human between
//! iterations are honoured.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::plan::{self, PlanTask, TaskCounts};
use crate::io::config::write_atomic;

/// Contents of a freshly created or reset plan.
pub const PLAN_PLACEHOLDER: &str = "# Implementation Plan\n\n\
<!-- The planning phase fills this file with `- [ ] task` lines. -->\n";

/// Read the plan; a missing file reads as empty.
pub fn read_plan(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))
}

pub fn load_tasks(path: &Path) -> Result<Vec<PlanTask>> {
    Ok(plan::parse_tasks(&read_plan(path)?))
}

pub fn task_counts(path: &Path) -> Result<TaskCounts> {
    Ok(plan::count_tasks(&load_tasks(path)?))
}

/// What [`complete_task`] found on the plan line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMark {
    /// The pending line was ticked.
    Marked,
    /// The line was already ticked, usually by the agent itself.
    AlreadyComplete,
    /// No line with this text remains.
    Missing,
}

/// Mark `text` complete, rewriting only its checklist line.
///
/// The plan is re-read first; a line someone else ticked or removed during
/// the iteration is reported instead of treated as an error.
pub fn complete_task(path: &Path, text: &str) -> Result<TaskMark> {
    let contents = read_plan(path)?;
    let tasks = plan::parse_tasks(&contents);
    if !tasks.iter().any(|task| task.is_pending() && task.text == text) {
        let mark = if tasks.iter().any(|task| task.complete && task.text == text) {
            TaskMark::AlreadyComplete
        } else {
            TaskMark::Missing
        };
        debug!(path = %path.display(), task = text, ?mark, "task not pending in plan");
        return Ok(mark);
    }
    let updated = plan::mark_complete(&contents, text)
        .with_context(|| format!("update plan {}", path.display()))?;
    debug!(path = %path.display(), task = text, "task marked complete");
    write_atomic(path, &updated)?;
    Ok(TaskMark::Marked)
}

/// Mark `text` complete with the skip annotation.
pub fn skip_task(path: &Path, text: &str) -> Result<()> {
    let contents = read_plan(path)?;
    let updated = plan::mark_skipped(&contents, text)
        .with_context(|| format!("update plan {}", path.display()))?;
    debug!(path = %path.display(), task = text, "task skipped");
    write_atomic(path, &updated)
}

/// Full reset: the only operation that clears completion flags.
pub fn reset_plan(path: &Path) -> Result<()> {
    write_atomic(path, PLAN_PLACEHOLDER)
}
