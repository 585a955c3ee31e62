//! Plan document parsing and checklist mutation.
//!
//! The plan is free-form markdown. Only checklist lines (`- [ ] text`,
//! `- [x] text`) are tasks; everything else, including checklist-looking lines
//! inside fenced code blocks, is preserved untouched.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

/// Annotation appended to a task the operator chose to skip.
pub const SKIP_MARKER: &str = "(SKIPPED)";

static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<prefix>\s*[-*]\s+\[)(?P<mark>[ xX])(?P<close>\]\s+)(?P<text>\S.*?)\s*$")
        .expect("task line regex should compile")
});

/// One checklist line inside a plan document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTask {
    /// Zero-based line index in the document.
    pub line: usize,
    /// Task description with any skip annotation removed.
    pub text: String,
    pub complete: bool,
    pub skipped: bool,
}

impl PlanTask {
    pub fn is_pending(&self) -> bool {
        !self.complete
    }
}

/// Task counts used by phase determination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
}

impl TaskCounts {
    pub fn completed(&self) -> usize {
        self.total - self.pending
    }
}

/// Parse every checklist line in plan order.
pub fn parse_tasks(contents: &str) -> Vec<PlanTask> {
    let mut tasks = Vec::new();
    let mut in_fence = false;
    for (line, raw) in contents.lines().enumerate() {
        if is_fence(raw) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = TASK_LINE.captures(raw) else {
            continue;
        };
        let complete = &caps["mark"] != " ";
        let (text, skipped) = strip_skip_marker(&caps["text"]);
        tasks.push(PlanTask {
            line,
            text,
            complete,
            skipped,
        });
    }
    tasks
}

/// First task in plan order whose completion flag is unset.
pub fn next_pending(tasks: &[PlanTask]) -> Option<&PlanTask> {
    tasks.iter().find(|task| task.is_pending())
}

pub fn count_tasks(tasks: &[PlanTask]) -> TaskCounts {
    TaskCounts {
        total: tasks.len(),
        pending: tasks.iter().filter(|task| task.is_pending()).count(),
    }
}

/// Descriptions of completed tasks, in plan order.
pub fn completed_texts(tasks: &[PlanTask]) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| task.complete)
        .map(|task| task.text.clone())
        .collect()
}

/// Mark the first pending task matching `text` as complete.
///
/// Completion is monotonic: the task must currently be pending, and no other
/// line changes.
pub fn mark_complete(contents: &str, text: &str) -> Result<String> {
    rewrite_task(contents, text, false)
}

/// Mark the first pending task matching `text` as complete with a skip annotation.
pub fn mark_skipped(contents: &str, text: &str) -> Result<String> {
    rewrite_task(contents, text, true)
}

fn rewrite_task(contents: &str, text: &str, skip: bool) -> Result<String> {
    let target = parse_tasks(contents)
        .into_iter()
        .find(|task| task.is_pending() && task.text == text)
        .ok_or_else(|| anyhow!("no pending task matching '{text}' in plan"))?;

    let mut out = String::with_capacity(contents.len() + SKIP_MARKER.len() + 1);
    for (idx, segment) in contents.split_inclusive('\n').enumerate() {
        if idx != target.line {
            out.push_str(segment);
            continue;
        }
        let (line, ending) = split_line_ending(segment);
        let caps = TASK_LINE
            .captures(line)
            .ok_or_else(|| anyhow!("plan line {} is no longer a task", idx + 1))?;
        out.push_str(&caps["prefix"]);
        out.push('x');
        out.push_str(&caps["close"]);
        out.push_str(&caps["text"]);
        if skip {
            out.push(' ');
            out.push_str(SKIP_MARKER);
        }
        out.push_str(ending);
    }
    Ok(out)
}

fn split_line_ending(segment: &str) -> (&str, &str) {
    if let Some(stripped) = segment.strip_suffix("\r\n") {
        (stripped, "\r\n")
    } else if let Some(stripped) = segment.strip_suffix('\n') {
        (stripped, "\n")
    } else {
        (segment, "")
    }
}

fn strip_skip_marker(text: &str) -> (String, bool) {
    match text.strip_suffix(SKIP_MARKER) {
        Some(rest) => (rest.trim_end().to_string(), true),
        None => (text.to_string(), false),
    }
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}
