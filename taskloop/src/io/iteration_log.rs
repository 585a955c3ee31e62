//! Per-unit artifacts under `.taskloop/sessions/<id>/iterations/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::ErrorPayload;
use crate::io::init::SessionPaths;

/// Kind of unit of work an artifacts directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Build,
    Plan,
    Spec,
    Agents,
}

impl UnitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Build => "build",
            UnitKind::Plan => "plan",
            UnitKind::Spec => "spec",
            UnitKind::Agents => "agents",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationMeta {
    pub session_id: String,
    pub unit: UnitKind,
    /// Build iterations only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub attempts: u32,
    pub outcome: &'static str,
    pub error: Option<ErrorPayload>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(session: &SessionPaths, label: &str) -> Self {
        let dir = session.iteration_dir(label);
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            log_path: dir.join("agent.log"),
            dir,
        }
    }

    /// Create the directory and record the prompt before the agent starts.
    pub fn prepare(&self, prompt: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))?;
        write_text(&self.prompt_path, prompt)
    }

    pub fn write_meta(&self, meta: &IterationMeta) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
        buf.push('\n');
        write_text(&self.meta_path, &buf)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_paths_are_stable() {
        let session = SessionPaths::new(PathBuf::from("/w/.taskloop/sessions/s-1"));
        let paths = IterationPaths::new(&session, "3");
        assert!(paths.dir.ends_with("sessions/s-1/iterations/3"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.log_path.ends_with("agent.log"));
    }

    #[test]
    fn writes_prompt_then_meta() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::new(temp.path().join("s-1"));
        let paths = IterationPaths::new(&session, "1");
        paths.prepare("prompt body").expect("prepare");
        paths
            .write_meta(&IterationMeta {
                session_id: "s-1".to_string(),
                unit: UnitKind::Build,
                iteration: Some(1),
                task: Some("A".to_string()),
                attempts: 2,
                outcome: "succeeded",
                error: None,
                started_at: "2026-01-01T00:00:00Z".to_string(),
                ended_at: "2026-01-01T00:00:05Z".to_string(),
                duration_ms: 5_000,
            })
            .expect("meta");

        assert_eq!(fs::read_to_string(&paths.prompt_path).expect("prompt"), "prompt body");
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta"))
                .expect("json");
        assert_eq!(meta["unit"], "build");
        assert_eq!(meta["attempts"], 2);
        assert!(meta["error"].is_null());
    }
}
